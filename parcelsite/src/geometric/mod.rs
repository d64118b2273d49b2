pub mod best_choice;
pub mod headroom;
pub mod natural_beauty;
pub mod ownership;
pub mod parcel;
pub mod parcel_map;
pub mod spatial_join;
pub mod ward;
