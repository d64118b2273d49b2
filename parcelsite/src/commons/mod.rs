pub mod basic_functions;
pub mod filter;
pub mod geometry;
#[cfg(not(feature = "proj"))]
pub mod national_grid;
