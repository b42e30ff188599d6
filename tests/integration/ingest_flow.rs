//! Venue ingest, canonical grouping and odds refresh.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::{Harness, MATCH_START};
use venue_router::types::{EventResult, EventStatus};

fn expected_key(normalized: &str, start: &str) -> String {
    let ts = start.parse::<DateTime<Utc>>().unwrap().timestamp();
    let slot = ts - ts.rem_euclid(1800);
    let digest = hex::encode(Sha256::digest(format!("{normalized}|{slot}").as_bytes()));
    digest[..32].to_string()
}

#[tokio::test]
async fn test_listings_group_across_venues() {
    let h = Harness::new().await;
    h.ingest().await;

    assert_eq!(h.count("events").await, 4);
    assert_eq!(h.count("canonical_events").await, 3);

    let key = expected_key("lakers vs celtics", MATCH_START);
    let canonical = h.store.get_canonical_by_key(&key).await.unwrap().expect("grouped canonical");
    assert_eq!(canonical.status, EventStatus::Active);
    assert_eq!(canonical.sport_type, "sports");
    let links = h.store.links_for_canonical(canonical.id).await.unwrap();
    assert_eq!(links.len(), 2);

    let poly = h.store.get_event_by_uuid("1_p1").await.unwrap().unwrap();
    let kalshi = h.store.get_event_by_uuid("2_K1").await.unwrap().unwrap();
    assert_eq!(h.store.canonical_for_event(poly.id).await.unwrap().unwrap().id, canonical.id);
    assert_eq!(h.store.canonical_for_event(kalshi.id).await.unwrap().unwrap().id, canonical.id);
}

#[tokio::test]
async fn test_stored_rows_keep_identity_and_price_bounds() {
    let h = Harness::new().await;
    h.ingest().await;

    let events: Vec<(String, i64, String)> =
        sqlx::query_as("SELECT event_uuid, platform_id, platform_event_id FROM events")
            .fetch_all(h.store.pool())
            .await
            .unwrap();
    for (uuid, platform_id, peid) in &events {
        assert_eq!(uuid, &format!("{platform_id}_{peid}"));
    }

    let prices: Vec<(f64,)> = sqlx::query_as("SELECT price FROM odds")
        .fetch_all(h.store.pool())
        .await
        .unwrap();
    assert_eq!(prices.len(), 8);
    assert!(prices.iter().all(|(p,)| (0.0..=1.0).contains(p)));
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let h = Harness::new().await;
    h.ingest().await;
    let events = h.count("events").await;
    let odds = h.count("odds").await;
    let links = h.count("event_platform_links").await;

    let (status, body) = h.request("POST", "/sync/platform/polymarket?type=sports", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events"], 3);
    assert_eq!(body["events_inserted"], 0);
    assert_eq!(body["events_updated"], 3);
    assert_eq!(body["odds_changed"], 0);

    assert_eq!(h.count("events").await, events);
    assert_eq!(h.count("odds").await, odds);
    assert_eq!(h.count("canonical_events").await, 3);
    assert_eq!(h.count("event_platform_links").await, links);
}

#[tokio::test]
async fn test_unknown_event_type_ingests_nothing() {
    let h = Harness::new().await;
    let (status, body) = h.request("POST", "/sync/platform/kalshi?type=politics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events"], 0);
    assert_eq!(body["canonicals"], 0);
    assert_eq!(h.count("events").await, 0);
}

#[tokio::test]
async fn test_markets_endpoint_lists_grouped_venues() {
    let h = Harness::new().await;
    h.ingest().await;

    let (status, body) = h.request("GET", "/api/markets?type=sports&page_size=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let (status, market) = h.request("GET", "/api/markets/2_K1", None).await;
    assert_eq!(status, StatusCode::OK);
    let venues = market["venues"].as_array().unwrap();
    assert_eq!(venues.len(), 2);
    assert_eq!(market["home_team"], "Celtics");
    assert_eq!(market["away_team"], "Lakers");
}

#[tokio::test]
async fn test_odds_sync_refreshes_prices() {
    let h = Harness::new().await;
    h.ingest().await;
    h.poly.set_prices("p1", &[("Lakers", 0.58), ("Celtics", 0.42)]);
    h.kalshi.set_error("HTTP 503");

    let report = h.sync.sync_odds(&Default::default()).await.unwrap();
    assert_eq!(report.events, 4);
    assert_eq!(report.rows, 2);
    assert_eq!(report.failures, 1);

    let event = h.store.get_event_by_uuid("1_p1").await.unwrap().unwrap();
    let odds = h.store.odds_for_event(event.id).await.unwrap();
    let lakers = odds.iter().find(|o| o.option_name == "Lakers").unwrap();
    assert!((lakers.price - 0.58).abs() < 1e-9);
    assert_eq!(h.count("odds").await, 8);
}

#[tokio::test]
async fn test_result_sync_skips_events_still_running() {
    let h = Harness::new().await;
    h.ingest().await;
    h.poly.set_result(
        "p2",
        EventResult {
            status: EventStatus::Resolved,
            result: Some("Heat".into()),
            result_source: "polymarket:p2".into(),
        },
    );

    // No end time yet, so nothing is due.
    let report = h.sync.sync_results(&Default::default()).await.unwrap();
    assert_eq!(report.checked, 0);

    let event = h.store.get_event_by_uuid("1_p2").await.unwrap().unwrap();
    sqlx::query("UPDATE events SET end_time = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::minutes(5))
        .bind(event.id)
        .execute(h.store.pool())
        .await
        .unwrap();
    let report = h.sync.sync_results(&Default::default()).await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.settlable_orders, 0);

    let event = h.store.get_event_by_uuid("1_p2").await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Resolved);
    assert_eq!(event.result.as_deref(), Some("Heat"));
}
