//! Venue integrations.
//!
//! Defines the `VenueAdapter` trait and provides implementations for:
//! - Polymarket: Gamma catalog for discovery, CLOB for order entry
//! - Kalshi: Trade API series/events listing and portfolio orders
//!
//! Order entry is an optional capability exposed through `trading()`.

pub mod convert;
pub mod http;
pub mod kalshi;
pub mod polymarket;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::types::{EventRecord, EventResult, NewOdds, RawEvent, KALSHI, POLYMARKET};

/// Receives batches of raw events from a streaming pull.
///
/// Returning an error aborts the stream and the error is surfaced by the
/// adapter. The adapter waits for `accept` before fetching the next chunk.
#[async_trait]
pub trait BatchSink: Send {
    async fn accept(&mut self, batch: Vec<RawEvent>) -> Result<()>;
}

/// Counters reported by one streaming pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub chunks: usize,
    pub skipped_chunks: usize,
    pub batches: usize,
    pub events: usize,
}

/// Abstraction over prediction-market venues.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Platform name, matching the seeded `platforms.name`.
    fn name(&self) -> &str;

    /// Seeded platform id.
    fn platform_id(&self) -> i64;

    /// Pull open events of `event_type`, delivering one batch per source
    /// chunk. A chunk that fails over HTTP is skipped with a warning.
    async fn fetch_events_stream(
        &self,
        event_type: &str,
        sink: &mut dyn BatchSink,
    ) -> Result<StreamStats>;

    /// Current prices for one venue event, bypassing any cache.
    async fn fetch_live_odds(&self, platform_event_id: &str) -> Result<Vec<NewOdds>>;

    /// Result of one venue event, `None` while it is still undecided.
    async fn fetch_event_result(&self, platform_event_id: &str) -> Result<Option<EventResult>>;

    /// Convert a raw listing into storable rows.
    fn convert_to_db_model(&self, raw: &RawEvent) -> EventRecord {
        convert::to_event_record(self.platform_id(), raw)
    }

    /// Order entry, when the venue supports it.
    fn trading(&self) -> Option<&dyn TradingVenue> {
        None
    }
}

/// Limit order relayed to a venue.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceOrderRequest {
    pub platform_event_id: String,
    /// Venue-native option label.
    pub bet_option: String,
    pub amount: f64,
    pub locked_odds: f64,
    /// Idempotency key forwarded to venues that accept one.
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceOrderReceipt {
    pub platform_order_id: String,
    pub status: String,
}

#[async_trait]
pub trait TradingVenue: Send + Sync {
    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<PlaceOrderReceipt>;
}

// ---------------------------------------------------------------------------
// Cross-batch dedup
// ---------------------------------------------------------------------------

/// Drops events already delivered earlier in the same pull.
#[derive(Debug, Default)]
pub struct SeenEvents {
    seen: HashSet<String>,
}

impl SeenEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only events whose id has not been seen, recording them.
    pub fn retain_new(&mut self, batch: Vec<RawEvent>) -> Vec<RawEvent> {
        let before = batch.len();
        let kept: Vec<RawEvent> = batch
            .into_iter()
            .filter(|e| !e.platform_event_id.is_empty())
            .filter(|e| self.seen.insert(e.platform_event_id.clone()))
            .collect();
        if kept.len() < before {
            debug!(dropped = before - kept.len(), "Dropped repeated events");
        }
        kept
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Deliver one chunk's events through the dedup set and sink.
pub(crate) async fn deliver_chunk(
    seen: &mut SeenEvents,
    sink: &mut dyn BatchSink,
    stats: &mut StreamStats,
    events: Vec<RawEvent>,
) -> Result<()> {
    stats.chunks += 1;
    let batch = seen.retain_new(events);
    if batch.is_empty() {
        return Ok(());
    }
    stats.batches += 1;
    stats.events += batch.len();
    sink.accept(batch).await
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Adapters keyed by platform id.
#[derive(Clone, Default)]
pub struct VenueRegistry {
    adapters: HashMap<i64, Arc<dyn VenueAdapter>>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one adapter per configured venue.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (name, platform_cfg) in &config.platforms {
            match name.as_str() {
                POLYMARKET => {
                    let client = polymarket::PolymarketClient::new(platform_cfg)?;
                    registry.insert(Arc::new(client));
                }
                KALSHI => {
                    let client = kalshi::KalshiClient::new(platform_cfg)?;
                    registry.insert(Arc::new(client));
                }
                other => warn!(platform = %other, "No adapter for configured platform, skipping"),
            }
        }
        info!(count = registry.len(), "Venue adapters initialised");
        Ok(registry)
    }

    pub fn insert(&mut self, adapter: Arc<dyn VenueAdapter>) {
        self.adapters.insert(adapter.platform_id(), adapter);
    }

    pub fn get(&self, platform_id: i64) -> Option<Arc<dyn VenueAdapter>> {
        self.adapters.get(&platform_id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn VenueAdapter>> {
        self.adapters
            .values()
            .find(|a| a.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
