//! Venue router: multi-venue prediction-market aggregation and order routing.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod chain;
pub mod config;
pub mod engine;
pub mod fiat;
pub mod logging;
pub mod platforms;
pub mod storage;
pub mod types;
