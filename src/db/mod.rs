//! Database module for rainwatch.
//!
//! Provides SQLite storage for stations, readings and anomaly records.

mod models;
mod store;

pub use models::*;
pub use store::*;
