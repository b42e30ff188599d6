//! Cross-venue grouping of events into canonical matches.
//!
//! Two venue events describe the same match when their normalised titles
//! agree and they start inside the same 30-minute slot. The grouping key
//! is a truncated SHA-256 of both, so it is stable across runs and hosts.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::storage::Store;
use crate::types::{AppError, Event, EventStatus, NewCanonicalEvent, Odds};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Events loaded per aggregation run.
pub const DEFAULT_EVENT_LIMIT: i64 = 5000;

/// Width of the start-time bucket.
pub const SLOT_SECONDS: i64 = 30 * 60;

const MAX_TEAM_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Canonical key
// ---------------------------------------------------------------------------

/// Lowercase, map everything outside `[a-z0-9 ]` to a space, collapse runs
/// of whitespace and trim.
pub fn normalize_title(title: &str) -> String {
    let mapped: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == ' ' { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Unix seconds of the slot containing `ts`.
pub fn slot_start(ts: chrono::DateTime<chrono::Utc>) -> i64 {
    ts.timestamp().div_euclid(SLOT_SECONDS) * SLOT_SECONDS
}

pub fn canonical_key(title: &str, start: chrono::DateTime<chrono::Utc>) -> String {
    let input = format!("{}|{}", normalize_title(title), slot_start(start));
    let digest = Sha256::digest(input.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(32);
    key
}

/// Two named sides from the first event quoting exactly two non-YES/NO
/// outcomes, sorted. Blank when no event qualifies.
pub fn extract_teams(events: &[Event], odds: &HashMap<i64, Vec<Odds>>) -> (String, String) {
    for event in events {
        let Some(rows) = odds.get(&event.id) else { continue };
        if rows.len() != 2 {
            continue;
        }
        let is_binary = rows.iter().all(|o| {
            let name = o.option_name.trim();
            name.eq_ignore_ascii_case("yes") || name.eq_ignore_ascii_case("no")
        });
        if is_binary {
            continue;
        }
        let mut names = [rows[0].option_name.clone(), rows[1].option_name.clone()];
        names.sort();
        let [home, away] = names;
        return (clip(&home), clip(&away));
    }
    (String::new(), String::new())
}

fn clip(s: &str) -> String {
    s.chars().take(MAX_TEAM_LEN).collect()
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateReport {
    pub events: usize,
    pub canonicals: usize,
    pub links: usize,
}

#[derive(Clone)]
pub struct Aggregator {
    store: Store,
}

impl Aggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Regroup the most recent `limit` events of `event_type`.
    pub async fn run(&self, event_type: &str, limit: Option<i64>) -> Result<AggregateReport, AppError> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_EVENT_LIMIT);
        let events = self.store.list_events_by_type(event_type, limit).await?;
        let mut report = AggregateReport {
            events: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return Ok(report);
        }

        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let mut odds: HashMap<i64, Vec<Odds>> = HashMap::new();
        for row in self.store.odds_for_events(&ids).await? {
            odds.entry(row.event_id).or_default().push(row);
        }

        for (key, group) in group_by_key(events) {
            let (home_team, away_team) = extract_teams(&group, &odds);
            let lead = &group[0];
            let canonical = NewCanonicalEvent {
                canonical_key: key,
                sport_type: event_type.to_string(),
                title: lead.title.clone(),
                home_team,
                away_team,
                match_time: group.iter().map(|e| e.start_time).min().unwrap_or(lead.start_time),
                status: group_status(&group),
            };
            let canonical_id = self.store.upsert_canonical(&canonical).await?;
            report.canonicals += 1;

            for event in &group {
                self.store.upsert_link(canonical_id, event.id).await?;
                report.links += 1;
            }
            debug!(
                canonical_id,
                key = %canonical.canonical_key,
                venues = group.len(),
                "Canonical refreshed"
            );
        }

        info!(
            event_type,
            events = report.events,
            canonicals = report.canonicals,
            links = report.links,
            "Aggregation complete"
        );
        Ok(report)
    }
}

/// Group events by canonical key, keeping first-seen order.
fn group_by_key(events: Vec<Event>) -> Vec<(String, Vec<Event>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<Event>)> = Vec::new();
    for event in events {
        let key = canonical_key(&event.title, event.start_time);
        match index.get(&key) {
            Some(&i) => groups[i].1.push(event),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![event]));
            }
        }
    }
    groups
}

/// Active while any venue still trades it.
fn group_status(group: &[Event]) -> EventStatus {
    if group.iter().any(|e| e.status == EventStatus::Active) {
        EventStatus::Active
    } else if group.iter().any(|e| e.status == EventStatus::Resolved) {
        EventStatus::Resolved
    } else {
        EventStatus::Canceled
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
