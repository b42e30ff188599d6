//! Background jobs.
//!
//! Three periodic loops share one [`SyncService`]:
//! - ingest: pull listings from each enabled venue, then re-aggregate;
//! - odds: refresh live prices of active events (opt-in);
//! - results: poll venues for outcomes of finished events and mark
//!   winning orders settlable.
//!
//! A failing venue is logged and the loop moves on.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aggregator::{AggregateReport, Aggregator};
use super::ingestor::{IngestReport, Ingestor};
use crate::config::SyncConfig;
use crate::platforms::VenueRegistry;
use crate::storage::Store;
use crate::types::{AppError, EventStatus, Platform, DEFAULT_EVENT_TYPE};

pub const ODDS_SYNC_BATCH: i64 = 200;
pub const RESULT_SYNC_BATCH: i64 = 100;

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub ingest: IngestReport,
    pub aggregate: AggregateReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OddsSyncReport {
    pub events: usize,
    pub rows: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultSyncReport {
    pub checked: usize,
    pub resolved: usize,
    pub settlable_orders: u64,
    pub failures: usize,
}

#[derive(Clone)]
pub struct SyncService {
    store: Store,
    registry: VenueRegistry,
    ingestor: Ingestor,
    aggregator: Aggregator,
    platforms: Vec<String>,
}

impl SyncService {
    /// `platforms` limits the scheduled jobs; empty means every enabled one.
    pub fn new(store: Store, registry: VenueRegistry, platforms: Vec<String>) -> Self {
        Self {
            ingestor: Ingestor::new(store.clone(), registry.clone()),
            aggregator: Aggregator::new(store.clone()),
            store,
            registry,
            platforms,
        }
    }

    /// Ingest one venue and rebuild canonical events for the type.
    pub async fn sync_platform(
        &self,
        platform: &str,
        event_type: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, AppError> {
        let ingest = self.ingestor.run(platform, event_type, cancel).await?;
        let aggregate = self.aggregator.run(event_type, None).await?;
        Ok(SyncReport { ingest, aggregate })
    }

    async fn targets(&self) -> Result<Vec<Platform>, AppError> {
        let rows = self.store.list_platforms().await?;
        Ok(rows
            .into_iter()
            .filter(|p| p.enabled)
            .filter(|p| {
                self.platforms.is_empty()
                    || self.platforms.iter().any(|n| n.eq_ignore_ascii_case(&p.name))
            })
            .filter(|p| self.registry.get(p.id).is_some())
            .collect())
    }

    /// One scheduled ingest pass. Returns the number of venues that synced.
    pub async fn ingest_all(&self, cancel: &CancellationToken) -> usize {
        let targets = match self.targets().await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Listing platforms failed");
                return 0;
            }
        };
        let mut ok = 0;
        for platform in targets {
            if cancel.is_cancelled() {
                break;
            }
            match self.sync_platform(&platform.name, DEFAULT_EVENT_TYPE, cancel).await {
                Ok(report) => {
                    ok += 1;
                    debug!(
                        platform = %platform.name,
                        canonicals = report.aggregate.canonicals,
                        "Platform synced"
                    );
                }
                Err(e) => error!(platform = %platform.name, error = %e, "Scheduled sync failed"),
            }
        }
        ok
    }

    /// Refresh live prices of active events on every target venue.
    pub async fn sync_odds(&self, cancel: &CancellationToken) -> Result<OddsSyncReport, AppError> {
        let mut report = OddsSyncReport::default();
        for platform in self.targets().await? {
            let Some(adapter) = self.registry.get(platform.id) else {
                continue;
            };
            for event in self.store.list_active_events(platform.id, ODDS_SYNC_BATCH).await? {
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                report.events += 1;
                match adapter.fetch_live_odds(&event.platform_event_id).await {
                    Ok(rows) if rows.is_empty() => {}
                    Ok(rows) => {
                        self.store.upsert_odds(event.id, &rows).await?;
                        report.rows += rows.len();
                    }
                    Err(e) => {
                        report.failures += 1;
                        warn!(event = %event.event_uuid, error = %format!("{e:#}"), "Odds refresh failed");
                    }
                }
            }
        }
        info!(events = report.events, rows = report.rows, failures = report.failures, "Odds sync complete");
        Ok(report)
    }

    /// Pull results for finished events and open settlement on winners.
    pub async fn sync_results(&self, cancel: &CancellationToken) -> Result<ResultSyncReport, AppError> {
        let mut report = ResultSyncReport::default();
        let now = Utc::now();
        for platform in self.targets().await? {
            let Some(adapter) = self.registry.get(platform.id) else {
                continue;
            };
            let due = self
                .store
                .list_events_awaiting_result(platform.id, now, RESULT_SYNC_BATCH)
                .await?;
            for event in due {
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                report.checked += 1;
                self.store.mark_result_checked(event.id, now).await?;
                let result = match adapter.fetch_event_result(&event.platform_event_id).await {
                    Ok(Some(r)) => r,
                    Ok(None) => continue,
                    Err(e) => {
                        report.failures += 1;
                        warn!(event = %event.event_uuid, error = %format!("{e:#}"), "Result lookup failed");
                        continue;
                    }
                };
                self.store.update_event_result(event.id, &result).await?;
                if result.status != EventStatus::Resolved {
                    continue;
                }
                report.resolved += 1;
                if let Some(winner) = result.result.as_deref() {
                    let n = self.store.mark_winning_orders_settlable(event.id, winner).await?;
                    report.settlable_orders += n;
                    info!(event = %event.event_uuid, winner, orders = n, "Event resolved");
                }
            }
        }
        debug!(
            checked = report.checked,
            resolved = report.resolved,
            settlable = report.settlable_orders,
            "Result sync complete"
        );
        Ok(report)
    }
}

/// Run `job` every `period` until `cancel` fires. The first run is
/// immediate; overrunning ticks are skipped rather than queued.
pub async fn run_every<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(job = name, interval_secs = period.as_secs(), "Background job started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(job = name, "Background job stopping");
                return;
            }
            _ = interval.tick() => job().await,
        }
    }
}

/// Start the configured background jobs.
pub fn spawn_jobs(
    service: SyncService,
    cfg: &SyncConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();

    let ingest = service.clone();
    let token = cancel.clone();
    handles.push(tokio::spawn(run_every("ingest", cfg.ingest_interval()?, cancel.clone(), move || {
        let svc = ingest.clone();
        let token = token.clone();
        async move {
            let synced = svc.ingest_all(&token).await;
            debug!(synced, "Ingest pass finished");
        }
    })));

    if cfg.odds_sync_enabled {
        let odds = service.clone();
        let token = cancel.clone();
        let period = Duration::from_secs(cfg.odds_sync_interval_sec.max(1));
        handles.push(tokio::spawn(run_every("odds", period, cancel.clone(), move || {
            let svc = odds.clone();
            let token = token.clone();
            async move {
                if let Err(e) = svc.sync_odds(&token).await {
                    error!(error = %e, "Odds sync failed");
                }
            }
        })));
    }

    let results = service;
    let token = cancel.clone();
    let period = Duration::from_secs(cfg.result_sync_interval_sec.max(1));
    handles.push(tokio::spawn(run_every("results", period, cancel, move || {
        let svc = results.clone();
        let token = token.clone();
        async move {
            if let Err(e) = svc.sync_results(&token).await {
                error!(error = %e, "Result sync failed");
            }
        }
    })));

    Ok(handles)
}
