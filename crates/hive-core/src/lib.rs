//! `hive-core` — configuration and shared error types for the hive cluster
//! infrastructure. Everything else in the workspace builds on this crate.

pub mod config;
pub mod error;
pub mod panics;

pub use config::HiveConfig;
pub use error::{HiveError, Result};
