//! Earthquake depth-class inference.
//!
//! Classifies an event as shallow, intermediate or deep from catalog
//! attributes (location, magnitude, network geometry, error estimates)
//! using a gradient-boosted tree ensemble and an optional LSTM, and trains
//! both from a historical catalog.

pub mod config;
pub mod error;
pub mod metrics;
pub mod ml;

pub use error::{AppError, Result};
