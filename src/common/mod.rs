//! Shared utilities that glue the different domains together.
pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod log;
pub mod metrics;
pub mod time;

pub use error::{CoreCode, CoreError, CoreResult};
