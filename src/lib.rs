//! Threshold-based DDoS detection and mitigation.
//!
//! The library holds the detection core and its HTTP surface; the binary
//! wires them to configuration and logging.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
