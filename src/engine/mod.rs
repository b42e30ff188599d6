//! Core engine: ingest, aggregation, routing and the order lifecycle.
//!
//! - `ingestor`: streams venue listings into the store
//! - `aggregator`: groups venue events into canonical matches
//! - `router`: live best-price selection across linked venues
//! - `coordinator`: deposit, quote, place, settle, withdraw
//! - `sync`: periodic background jobs

pub mod aggregator;
pub mod coordinator;
pub mod ingestor;
pub mod router;
pub mod sync;

use crate::types::AppError;

/// Map an adapter error onto the core error kinds.
///
/// Errors that already carry an `AppError` (raised by a sink, or by the
/// store underneath one) keep their kind; everything else is the venue's.
pub(crate) fn venue_error(venue: &str, err: anyhow::Error) -> AppError {
    match err.downcast::<AppError>() {
        Ok(app) => app,
        Err(other) => AppError::venue(venue, format!("{other:#}")),
    }
}
