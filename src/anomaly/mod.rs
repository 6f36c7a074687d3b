//! Anomaly detection and lifecycle.
//!
//! The classifier turns a reading plus its recent history into detections;
//! the ledger turns detections into durable records and resolves them with
//! human feedback.

mod classifier;
mod ledger;

pub use classifier::*;
pub use ledger::*;
