//! Streaming ingest of one venue into the store.
//!
//! The adapter pulls one source chunk at a time and hands it to a sink;
//! the sink converts, dedups and upserts the batch in a single
//! transaction before the adapter is allowed to fetch the next chunk.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::venue_error;
use crate::platforms::{BatchSink, StreamStats, VenueAdapter, VenueRegistry};
use crate::storage::{Store, UpsertStats};
use crate::types::{unique_event_platform, AppError, EventRecord, NewOdds, RawEvent};

/// Summary of one ingest run.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub platform: String,
    pub stream: StreamStats,
    pub upserts: UpsertStats,
    pub elapsed_ms: u128,
}

#[derive(Clone)]
pub struct Ingestor {
    store: Store,
    registry: VenueRegistry,
}

impl Ingestor {
    pub fn new(store: Store, registry: VenueRegistry) -> Self {
        Self { store, registry }
    }

    /// Pull every open `event_type` listing of `platform` into the store.
    pub async fn run(
        &self,
        platform: &str,
        event_type: &str,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, AppError> {
        let row = self
            .store
            .get_platform_by_name(platform)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("platform {platform} not found")))?;
        if !row.enabled {
            return Err(AppError::InvalidInput(format!("platform {} is disabled", row.name)));
        }
        let adapter = self
            .registry
            .get(row.id)
            .ok_or_else(|| AppError::Internal(format!("no adapter configured for {}", row.name)))?;

        info!(platform = %row.name, event_type, "Ingest starting");
        let started = Instant::now();
        let mut sink = StoreSink {
            adapter: adapter.as_ref(),
            store: &self.store,
            cancel,
            stats: UpsertStats::default(),
        };
        let stream = adapter
            .fetch_events_stream(event_type, &mut sink)
            .await
            .map_err(|e| venue_error(&row.name, e))?;

        let report = IngestReport {
            platform: row.name,
            stream,
            upserts: sink.stats,
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(
            platform = %report.platform,
            chunks = report.stream.chunks,
            skipped = report.stream.skipped_chunks,
            events = report.stream.events,
            inserted = report.upserts.events_inserted,
            updated = report.upserts.events_updated,
            odds_changed = report.upserts.odds_inserted + report.upserts.odds_updated,
            elapsed_ms = report.elapsed_ms as u64,
            "Ingest complete"
        );
        Ok(report)
    }
}

/// Converts each batch and writes it through the store.
struct StoreSink<'a> {
    adapter: &'a dyn VenueAdapter,
    store: &'a Store,
    cancel: &'a CancellationToken,
    stats: UpsertStats,
}

#[async_trait]
impl BatchSink for StoreSink<'_> {
    async fn accept(&mut self, batch: Vec<RawEvent>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled.into());
        }
        let records: Vec<EventRecord> = batch
            .iter()
            .map(|raw| self.adapter.convert_to_db_model(raw))
            .collect();
        let records = dedup_records(records);
        let stats = self.store.upsert_event_records(&records).await?;
        debug!(
            platform = self.adapter.name(),
            events = records.len(),
            odds_unchanged = stats.odds_unchanged,
            "Batch stored"
        );
        self.stats.merge(stats);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Batch dedup
// ---------------------------------------------------------------------------

/// Collapse a batch so every event and every odds key appears once.
///
/// The newest `updated_at` wins; on a tie the later row wins. Odds rows
/// without a key get one derived from their identity.
pub fn dedup_records(records: Vec<EventRecord>) -> Vec<EventRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut by_uuid: HashMap<String, EventRecord> = HashMap::new();
    for rec in records {
        let key = rec.event.event_uuid.clone();
        match by_uuid.get(&key) {
            Some(existing) if existing.event.updated_at > rec.event.updated_at => {}
            Some(_) => {
                by_uuid.insert(key, rec);
            }
            None => {
                order.push(key.clone());
                by_uuid.insert(key, rec);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|k| by_uuid.remove(&k))
        .map(|mut rec| {
            rec.odds = dedup_odds(rec.odds);
            rec
        })
        .collect()
}

fn dedup_odds(odds: Vec<NewOdds>) -> Vec<NewOdds> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, NewOdds> = HashMap::new();
    for mut o in odds {
        if o.unique_event_platform.is_empty() {
            o.unique_event_platform =
                unique_event_platform(o.platform_id, &o.platform_event_id, &o.option_name);
        }
        let key = o.unique_event_platform.clone();
        match by_key.get(&key) {
            Some(existing) if existing.updated_at > o.updated_at => {}
            Some(_) => {
                by_key.insert(key, o);
            }
            None => {
                order.push(key.clone());
                by_key.insert(key, o);
            }
        }
    }
    order.into_iter().filter_map(|k| by_key.remove(&k)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
