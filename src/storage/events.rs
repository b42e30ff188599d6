//! Events and odds.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::debug;

use super::{Store, StoreResult};
use crate::types::{Event, EventRecord, EventResult, EventStatus, NewEvent, NewOdds, Odds};

/// Row counts of one upsert transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub events_inserted: usize,
    pub events_updated: usize,
    pub odds_inserted: usize,
    pub odds_updated: usize,
    pub odds_unchanged: usize,
}

impl UpsertStats {
    pub fn merge(&mut self, other: UpsertStats) {
        self.events_inserted += other.events_inserted;
        self.events_updated += other.events_updated;
        self.odds_inserted += other.odds_inserted;
        self.odds_updated += other.odds_updated;
        self.odds_unchanged += other.odds_unchanged;
    }
}

const PRICE_EPSILON: f64 = 1e-9;

impl Store {
    /// Upsert a batch of events with their odds in one transaction.
    pub async fn upsert_event_records(&self, records: &[EventRecord]) -> StoreResult<UpsertStats> {
        let mut stats = UpsertStats::default();
        let mut tx = self.pool.begin().await?;
        for record in records {
            let (event_id, inserted) = upsert_event_tx(&mut tx, &record.event).await?;
            if inserted {
                stats.events_inserted += 1;
            } else {
                stats.events_updated += 1;
            }
            for odds in &record.odds {
                upsert_odds_tx(&mut tx, event_id, odds, &mut stats).await?;
            }
        }
        tx.commit().await?;
        debug!(
            events = records.len(),
            inserted = stats.events_inserted,
            odds_changed = stats.odds_inserted + stats.odds_updated,
            "Batch upserted"
        );
        Ok(stats)
    }

    /// Write fresh prices for one stored event.
    pub async fn upsert_odds(&self, event_id: i64, odds: &[NewOdds]) -> StoreResult<UpsertStats> {
        let mut stats = UpsertStats::default();
        let mut tx = self.pool.begin().await?;
        for o in odds {
            upsert_odds_tx(&mut tx, event_id, o, &mut stats).await?;
        }
        tx.commit().await?;
        Ok(stats)
    }

    pub async fn get_event(&self, id: i64) -> StoreResult<Option<Event>> {
        let row = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_event_by_uuid(&self, event_uuid: &str) -> StoreResult<Option<Event>> {
        let row = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE event_uuid = ?")
            .bind(event_uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_event_by_platform_id(
        &self,
        platform_id: i64,
        platform_event_id: &str,
    ) -> StoreResult<Option<Event>> {
        let row = sqlx::query_as::<_, Event>(
            "SELECT * FROM events WHERE platform_id = ? AND platform_event_id = ?",
        )
        .bind(platform_id)
        .bind(platform_event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Most recently updated events of one type, any platform.
    pub async fn list_events_by_type(&self, event_type: &str, limit: i64) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, Event>(
            "SELECT * FROM events WHERE event_type = ? ORDER BY updated_at DESC, id DESC LIMIT ?",
        )
        .bind(event_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_active_events(&self, platform_id: i64, limit: i64) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, Event>(
            "SELECT * FROM events WHERE platform_id = ? AND status = ? \
             ORDER BY start_time ASC, id ASC LIMIT ?",
        )
        .bind(platform_id)
        .bind(EventStatus::Active)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Active events whose end time has passed. Never-checked events come
    /// first, then the least recently checked, so undecided events rotate
    /// instead of holding the batch.
    pub async fn list_events_awaiting_result(
        &self,
        platform_id: i64,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, Event>(
            "SELECT * FROM events WHERE platform_id = ? AND status = ? \
             AND end_time IS NOT NULL AND end_time <= ? \
             ORDER BY result_checked_at IS NOT NULL, result_checked_at ASC, end_time ASC, id ASC \
             LIMIT ?",
        )
        .bind(platform_id)
        .bind(EventStatus::Active)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Stamp a result lookup on an event, whatever its outcome.
    pub async fn mark_result_checked(&self, event_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE events SET result_checked_at = ? WHERE id = ?")
            .bind(at)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a venue result on an event.
    pub async fn update_event_result(&self, event_id: i64, result: &EventResult) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE events SET status = ?, result = ?, result_source = ?, updated_at = ? WHERE id = ?",
        )
        .bind(result.status)
        .bind(result.result.as_deref())
        .bind(&result.result_source)
        .bind(Utc::now())
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn odds_for_event(&self, event_id: i64) -> StoreResult<Vec<Odds>> {
        let rows = sqlx::query_as::<_, Odds>("SELECT * FROM odds WHERE event_id = ? ORDER BY id")
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn odds_for_events(&self, event_ids: &[i64]) -> StoreResult<Vec<Odds>> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM odds WHERE event_id IN (");
        let mut sep = qb.separated(", ");
        for id in event_ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(") ORDER BY event_id, id");
        let rows = qb.build_query_as::<Odds>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn count_events(&self) -> StoreResult<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_odds(&self) -> StoreResult<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM odds")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

/// Upsert one event keyed on (platform_id, platform_event_id).
/// Returns its id and whether it was newly inserted.
async fn upsert_event_tx(tx: &mut Transaction<'_, Sqlite>, e: &NewEvent) -> StoreResult<(i64, bool)> {
    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM events WHERE platform_id = ? AND platform_event_id = ?")
            .bind(e.platform_id)
            .bind(&e.platform_event_id)
            .fetch_optional(&mut **tx)
            .await?;

    let options = serde_json::to_string(&e.options).unwrap_or_else(|_| "[]".to_string());
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO events (event_uuid, platform_id, platform_event_id, title, event_type, \
             start_time, end_time, status, options, result, result_source, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(platform_id, platform_event_id) DO UPDATE SET \
             title = excluded.title, \
             event_type = excluded.event_type, \
             start_time = excluded.start_time, \
             end_time = excluded.end_time, \
             status = excluded.status, \
             options = excluded.options, \
             result = COALESCE(excluded.result, events.result), \
             result_source = COALESCE(excluded.result_source, events.result_source), \
             updated_at = excluded.updated_at \
         RETURNING id",
    )
    .bind(&e.event_uuid)
    .bind(e.platform_id)
    .bind(&e.platform_event_id)
    .bind(&e.title)
    .bind(&e.event_type)
    .bind(e.start_time)
    .bind(e.end_time)
    .bind(e.status)
    .bind(options)
    .bind(e.result.as_deref())
    .bind(e.result_source.as_deref())
    .bind(Utc::now())
    .bind(e.updated_at)
    .fetch_one(&mut **tx)
    .await?;

    Ok((id, existing.is_none()))
}

/// Upsert one odds row keyed on `unique_event_platform`. Unchanged prices
/// are left untouched.
async fn upsert_odds_tx(
    tx: &mut Transaction<'_, Sqlite>,
    event_id: i64,
    o: &NewOdds,
    stats: &mut UpsertStats,
) -> StoreResult<()> {
    let existing: Option<(f64, String, i64)> = sqlx::query_as(
        "SELECT price, option_type, event_id FROM odds WHERE unique_event_platform = ?",
    )
    .bind(&o.unique_event_platform)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some((price, option_type, stored_event)) = &existing {
        if (price - o.price).abs() < PRICE_EPSILON
            && option_type == o.option_type.as_str()
            && *stored_event == event_id
        {
            stats.odds_unchanged += 1;
            return Ok(());
        }
    }

    sqlx::query(
        "INSERT INTO odds (event_id, platform_id, platform_event_id, option_name, option_type, \
             price, unique_event_platform, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(unique_event_platform) DO UPDATE SET \
             event_id = excluded.event_id, \
             option_type = excluded.option_type, \
             price = excluded.price, \
             updated_at = excluded.updated_at",
    )
    .bind(event_id)
    .bind(o.platform_id)
    .bind(&o.platform_event_id)
    .bind(&o.option_name)
    .bind(o.option_type)
    .bind(o.price.clamp(0.0, 1.0))
    .bind(&o.unique_event_platform)
    .bind(o.updated_at)
    .execute(&mut **tx)
    .await?;

    if existing.is_some() {
        stats.odds_updated += 1;
    } else {
        stats.odds_inserted += 1;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::convert::to_event_record;
    use crate::types::{OptionType, RawEvent, RawMarket};

    fn record(platform_id: i64, peid: &str, title: &str, prices: [f64; 2]) -> EventRecord {
        to_event_record(
            platform_id,
            &RawEvent {
                platform_event_id: peid.into(),
                title: title.into(),
                event_type: "sports".into(),
                start_time: Some("2026-07-01T19:00:00Z".into()),
                end_time: Some("2026-07-01T22:00:00Z".into()),
                status: "open".into(),
                markets: vec![RawMarket {
                    market_id: "m".into(),
                    outcomes: vec!["YES".into(), "NO".into()],
                    prices: prices.to_vec(),
                }],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let store = Store::in_memory().await.unwrap();
        let stats = store
            .upsert_event_records(&[record(2, "KX-1", "Lakers vs Celtics", [0.55, 0.45])])
            .await
            .unwrap();
        assert_eq!(stats.events_inserted, 1);
        assert_eq!(stats.odds_inserted, 2);

        let stats = store
            .upsert_event_records(&[record(2, "KX-1", "Lakers @ Celtics", [0.60, 0.45])])
            .await
            .unwrap();
        assert_eq!(stats.events_updated, 1);
        assert_eq!(stats.odds_updated, 1);
        assert_eq!(stats.odds_unchanged, 1);

        let e = store.get_event_by_uuid("2_KX-1").await.unwrap().unwrap();
        assert_eq!(e.title, "Lakers @ Celtics");
        assert_eq!(e.status, EventStatus::Active);
        assert_eq!(e.options, "[\"YES\",\"NO\"]");
        let odds = store.odds_for_event(e.id).await.unwrap();
        assert_eq!(odds.len(), 2);
        assert!((odds[0].price - 0.60).abs() < 1e-10);
        assert_eq!(odds[1].option_type, OptionType::Lose);
    }

    #[tokio::test]
    async fn test_reingest_same_payload_changes_nothing() {
        let store = Store::in_memory().await.unwrap();
        let batch = vec![
            record(1, "100", "A vs B", [0.5, 0.5]),
            record(1, "101", "C vs D", [0.3, 0.7]),
        ];
        store.upsert_event_records(&batch).await.unwrap();
        let stats = store.upsert_event_records(&batch).await.unwrap();

        assert_eq!(stats.events_inserted, 0);
        assert_eq!(stats.odds_inserted + stats.odds_updated, 0);
        assert_eq!(stats.odds_unchanged, 4);
        assert_eq!(store.count_events().await.unwrap(), 2);
        assert_eq!(store.count_odds().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_non_finite_price_does_not_abort_batch() {
        let store = Store::in_memory().await.unwrap();
        let batch = vec![
            record(1, "ok", "A vs B", [0.4, 0.6]),
            record(1, "bad", "C vs D", [f64::NAN, f64::INFINITY]),
        ];
        let stats = store.upsert_event_records(&batch).await.unwrap();
        assert_eq!(stats.events_inserted, 2);

        let bad = store.get_event_by_uuid("1_bad").await.unwrap().unwrap();
        let odds = store.odds_for_event(bad.id).await.unwrap();
        assert_eq!(odds.len(), 2);
        assert!(odds.iter().all(|o| o.price == 0.0));
    }

    #[tokio::test]
    async fn test_same_id_on_two_platforms_is_two_events() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_event_records(&[record(1, "X", "t", [0.5, 0.5]), record(2, "X", "t", [0.5, 0.5])])
            .await
            .unwrap();
        assert_eq!(store.count_events().await.unwrap(), 2);
        assert!(store.get_event_by_platform_id(1, "X").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_result_and_listings() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_event_records(&[record(2, "KX-9", "Game", [0.5, 0.5])])
            .await
            .unwrap();
        let e = store.get_event_by_uuid("2_KX-9").await.unwrap().unwrap();

        let later = e.end_time.unwrap() + chrono::Duration::minutes(1);
        let due = store.list_events_awaiting_result(2, later, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        let early = e.end_time.unwrap() - chrono::Duration::minutes(1);
        assert!(store.list_events_awaiting_result(2, early, 10).await.unwrap().is_empty());

        let updated = store
            .update_event_result(
                e.id,
                &EventResult {
                    status: EventStatus::Resolved,
                    result: Some("YES".into()),
                    result_source: "kalshi:KX-9".into(),
                },
            )
            .await
            .unwrap();
        assert!(updated);
        let e = store.get_event(e.id).await.unwrap().unwrap();
        assert_eq!(e.status, EventStatus::Resolved);
        assert_eq!(e.result.as_deref(), Some("YES"));
        assert!(store.list_active_events(2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checked_events_yield_to_unchecked() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_event_records(&[record(2, "old", "A", [0.5, 0.5]), record(2, "new", "B", [0.5, 0.5])])
            .await
            .unwrap();
        let old = store.get_event_by_uuid("2_old").await.unwrap().unwrap();
        let now = old.end_time.unwrap() + chrono::Duration::hours(1);

        // Same end time; id breaks the tie until one is checked.
        let due = store.list_events_awaiting_result(2, now, 1).await.unwrap();
        assert_eq!(due[0].event_uuid, "2_old");

        store.mark_result_checked(old.id, now).await.unwrap();
        let due = store.list_events_awaiting_result(2, now, 1).await.unwrap();
        assert_eq!(due[0].event_uuid, "2_new");

        let new = store.get_event_by_uuid("2_new").await.unwrap().unwrap();
        store.mark_result_checked(new.id, now + chrono::Duration::minutes(5)).await.unwrap();
        let due = store.list_events_awaiting_result(2, now, 2).await.unwrap();
        assert_eq!(due[0].event_uuid, "2_old");
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn test_odds_for_events_and_write_back() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_event_records(&[record(1, "a", "t", [0.5, 0.5]), record(2, "b", "t", [0.4, 0.6])])
            .await
            .unwrap();
        let a = store.get_event_by_uuid("1_a").await.unwrap().unwrap();
        let b = store.get_event_by_uuid("2_b").await.unwrap().unwrap();
        assert_eq!(store.odds_for_events(&[a.id, b.id]).await.unwrap().len(), 4);
        assert!(store.odds_for_events(&[]).await.unwrap().is_empty());

        let fresh = vec![NewOdds::new(2, "b", "YES", OptionType::Win, 0.45)];
        let stats = store.upsert_odds(b.id, &fresh).await.unwrap();
        assert_eq!(stats.odds_updated, 1);
        let odds = store.odds_for_event(b.id).await.unwrap();
        assert!((odds[0].price - 0.45).abs() < 1e-10);
    }
}
