pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod ledger;
pub mod persistence;
pub mod portfolio;
pub mod positions;
pub mod telemetry;
pub mod types;

pub use error::{Error, ErrorKind, Result};
