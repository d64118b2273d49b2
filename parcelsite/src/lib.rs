pub mod collect;
pub mod commons;
pub mod config;
pub mod error;
pub mod geo_core;
pub mod geometric;
pub mod visual;

pub use config::PipelineConfig;
pub use error::Error;
