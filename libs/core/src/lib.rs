pub mod cache;
pub mod error;
pub mod ipset;
pub mod metrics;
pub mod model;
pub mod rules;
pub mod shim;
pub mod telemetry;
pub mod translate;
pub mod workqueue;

pub use error::{Error, Result};
