pub mod checkpoint;
pub mod config;
pub mod error;
pub mod loss;
pub mod metric;
pub mod model;
pub mod ops;
pub mod train;

pub use error::{Result, VqError};
