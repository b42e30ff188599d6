//! Raw venue listing → storable `NewEvent` / `NewOdds` rows.
//!
//! Shared by every adapter so that truncation, timestamp parsing, status
//! mapping and option typing behave identically across venues.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::types::{
    event_uuid, EventRecord, EventStatus, NewEvent, NewOdds, OptionType, RawEvent, RawMarket,
    DEFAULT_EVENT_TYPE,
};

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_EVENT_ID_LEN: usize = 128;
pub const MAX_OPTION_LEN: usize = 64;
pub const MAX_RESULT_SOURCE_LEN: usize = 256;

/// Placeholder option emitted when a market carries no usable outcomes.
pub const DEFAULT_OPTION: &str = "default";

/// Truncate to at most `max` characters, logging when anything is cut.
pub fn truncate(field: &str, value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    warn!(field, max, original_len = value.chars().count(), "Truncating field");
    value.chars().take(max).collect()
}

/// Parse a venue timestamp, trying each known layout in turn.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    for layout in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Some(dt) = NaiveDate::parse_from_str(s, layout)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Some(dt.and_utc());
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    None
}

/// Like `parse_timestamp`, substituting now when the value is unusable.
pub fn parse_timestamp_or_now(field: &str, raw: Option<&str>) -> DateTime<Utc> {
    match raw {
        Some(s) => parse_timestamp(s).unwrap_or_else(|| {
            warn!(field, value = %s, "Unparseable timestamp, using now");
            Utc::now()
        }),
        None => {
            debug!(field, "Missing timestamp, using now");
            Utc::now()
        }
    }
}

/// Odds rows of one market: outcomes zipped with prices by index.
///
/// A market whose outcome and price arrays are empty or of unequal length
/// yields a single zero-priced placeholder.
pub fn market_odds(platform_id: i64, platform_event_id: &str, market: &RawMarket) -> Vec<NewOdds> {
    let usable = !market.outcomes.is_empty()
        && market.outcomes.len() == market.prices.len()
        && market.outcomes.iter().all(|o| !o.trim().is_empty());
    if !usable {
        debug!(
            platform_event_id,
            market_id = %market.market_id,
            "Market has no usable outcomes, emitting placeholder"
        );
        return vec![NewOdds::new(
            platform_id,
            platform_event_id,
            DEFAULT_OPTION,
            OptionType::Win,
            0.0,
        )];
    }

    let count = market.outcomes.len();
    market
        .outcomes
        .iter()
        .zip(&market.prices)
        .enumerate()
        .map(|(idx, (name, price))| {
            let name = truncate("option_name", name.trim(), MAX_OPTION_LEN);
            let option_type = OptionType::classify(&name, idx, count);
            NewOdds::new(platform_id, platform_event_id, &name, option_type, *price)
        })
        .collect()
}

/// Convert a raw listing into an event with all of its odds.
pub fn to_event_record(platform_id: i64, raw: &RawEvent) -> EventRecord {
    let platform_event_id = truncate("platform_event_id", raw.platform_event_id.trim(), MAX_EVENT_ID_LEN);
    let title = truncate("title", raw.title.trim(), MAX_TITLE_LEN);
    let event_type = if raw.event_type.trim().is_empty() {
        DEFAULT_EVENT_TYPE.to_string()
    } else {
        raw.event_type.trim().to_lowercase()
    };

    let start_time = parse_timestamp_or_now("start_time", raw.start_time.as_deref());
    let end_time = raw.end_time.as_deref().and_then(|s| {
        let parsed = parse_timestamp(s);
        if parsed.is_none() {
            warn!(value = %s, "Unparseable end_time, leaving empty");
        }
        parsed
    });

    let markets: Vec<RawMarket> = if raw.markets.is_empty() {
        vec![RawMarket::default()]
    } else {
        raw.markets.clone()
    };
    let odds: Vec<NewOdds> = markets
        .iter()
        .flat_map(|m| market_odds(platform_id, &platform_event_id, m))
        .collect();

    let mut options: Vec<String> = Vec::new();
    for o in &odds {
        if !options.contains(&o.option_name) {
            options.push(o.option_name.clone());
        }
    }

    let event = NewEvent {
        event_uuid: event_uuid(platform_id, &platform_event_id),
        platform_id,
        platform_event_id,
        title,
        event_type,
        start_time,
        end_time,
        status: EventStatus::from_venue(&raw.status),
        options,
        result: raw.result.clone().filter(|r| !r.trim().is_empty()),
        result_source: raw
            .result_source
            .as_deref()
            .map(|s| truncate("result_source", s, MAX_RESULT_SOURCE_LEN)),
        updated_at: Utc::now(),
    };

    EventRecord { event, odds }
}

/// Parse a JSON-encoded string array such as `"[\"Yes\",\"No\"]"`.
///
/// Falls back to a lenient comma split when the value is not valid JSON.
pub fn parse_string_array(s: &str) -> Vec<String> {
    if let Ok(v) = serde_json::from_str::<Vec<String>>(s) {
        return v;
    }
    let cleaned = s.replace(['[', ']', '"', '\\'], "");
    cleaned
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Parse a JSON-encoded price array. Any unparseable element empties the
/// result so the market falls back to the placeholder.
pub fn parse_price_array(s: &str) -> Vec<f64> {
    let parts = parse_string_array(s);
    let parsed: Option<Vec<f64>> = parts
        .iter()
        .map(|p| p.parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect();
    parsed.unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
