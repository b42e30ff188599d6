//! Mock venue for integration testing.
//!
//! Provides a deterministic `VenueAdapter` + `TradingVenue` that serves a
//! fixed listing, quotes controllable live prices, reports configurable
//! results and records every order it accepts. All state is in-memory.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use venue_router::platforms::{
    BatchSink, PlaceOrderReceipt, PlaceOrderRequest, StreamStats, TradingVenue, VenueAdapter,
};
use venue_router::types::{EventResult, NewOdds, OptionType, RawEvent, RawMarket};

pub struct MockVenue {
    platform_id: i64,
    name: String,
    listing: Vec<RawEvent>,
    /// Events are delivered in chunks of this size.
    chunk_size: usize,
    prices: Arc<Mutex<HashMap<String, Vec<(String, f64)>>>>,
    results: Arc<Mutex<HashMap<String, EventResult>>>,
    placed: Arc<Mutex<Vec<PlaceOrderRequest>>>,
    /// If set, live odds and order entry fail with this message.
    force_error: Arc<Mutex<Option<String>>>,
}

impl MockVenue {
    pub fn new(platform_id: i64, name: &str, listing: Vec<RawEvent>) -> Self {
        Self {
            platform_id,
            name: name.to_string(),
            listing,
            chunk_size: 2,
            prices: Arc::new(Mutex::new(HashMap::new())),
            results: Arc::new(Mutex::new(HashMap::new())),
            placed: Arc::new(Mutex::new(Vec::new())),
            force_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Live prices for `platform_event_id`, by outcome label.
    pub fn set_prices(&self, platform_event_id: &str, prices: &[(&str, f64)]) {
        self.prices.lock().unwrap().insert(
            platform_event_id.to_string(),
            prices.iter().map(|(n, p)| (n.to_string(), *p)).collect(),
        );
    }

    pub fn set_result(&self, platform_event_id: &str, result: EventResult) {
        self.results
            .lock()
            .unwrap()
            .insert(platform_event_id.to_string(), result);
    }

    /// Force live odds and order entry to fail.
    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn placed(&self) -> Vec<PlaceOrderRequest> {
        self.placed.lock().unwrap().clone()
    }

    fn check_error(&self) -> Result<()> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }
}

/// A two-outcome sports listing.
pub fn listing(platform_event_id: &str, title: &str, start: &str, outcomes: [&str; 2]) -> RawEvent {
    RawEvent {
        platform_event_id: platform_event_id.to_string(),
        title: title.to_string(),
        event_type: "sports".to_string(),
        start_time: Some(start.to_string()),
        end_time: None,
        status: "open".to_string(),
        markets: vec![RawMarket {
            market_id: platform_event_id.to_string(),
            outcomes: outcomes.iter().map(|o| o.to_string()).collect(),
            prices: vec![0.5, 0.5],
        }],
        result: None,
        result_source: None,
    }
}

#[async_trait]
impl VenueAdapter for MockVenue {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform_id(&self) -> i64 {
        self.platform_id
    }

    async fn fetch_events_stream(&self, event_type: &str, sink: &mut dyn BatchSink) -> Result<StreamStats> {
        let mut stats = StreamStats::default();
        let wanted: Vec<RawEvent> = self
            .listing
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect();
        for chunk in wanted.chunks(self.chunk_size.max(1)) {
            stats.chunks += 1;
            stats.batches += 1;
            stats.events += chunk.len();
            sink.accept(chunk.to_vec()).await?;
        }
        Ok(stats)
    }

    async fn fetch_live_odds(&self, platform_event_id: &str) -> Result<Vec<NewOdds>> {
        self.check_error()?;
        let prices = self.prices.lock().unwrap();
        let Some(rows) = prices.get(platform_event_id) else {
            return Ok(Vec::new());
        };
        let count = rows.len();
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, (name, price))| {
                NewOdds::new(
                    self.platform_id,
                    platform_event_id,
                    name,
                    OptionType::classify(name, i, count),
                    *price,
                )
            })
            .collect())
    }

    async fn fetch_event_result(&self, platform_event_id: &str) -> Result<Option<EventResult>> {
        Ok(self.results.lock().unwrap().get(platform_event_id).cloned())
    }

    fn trading(&self) -> Option<&dyn TradingVenue> {
        Some(self)
    }
}

#[async_trait]
impl TradingVenue for MockVenue {
    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<PlaceOrderReceipt> {
        self.check_error()?;
        self.placed.lock().unwrap().push(req.clone());
        Ok(PlaceOrderReceipt {
            platform_order_id: format!("{}-{}", self.name, Uuid::new_v4()),
            status: "resting".to_string(),
        })
    }
}
