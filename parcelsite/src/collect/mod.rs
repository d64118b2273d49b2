pub mod global_variables;
pub mod layer;
pub mod os_places;
pub mod registry;
