//! Canonical events and their per-venue links.

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};

use super::{Page, Store, StoreResult};
use crate::types::{AppError, CanonicalEvent, EventPlatformLink, EventStatus, NewCanonicalEvent};

/// Filters for the canonical market listing.
#[derive(Debug, Clone, Default)]
pub struct CanonicalFilter {
    pub status: Option<EventStatus>,
    pub sport_type: Option<String>,
}

impl Store {
    /// Upsert on `canonical_key`, refreshing the descriptive fields.
    pub async fn upsert_canonical(&self, c: &NewCanonicalEvent) -> StoreResult<i64> {
        let now = Utc::now();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO canonical_events (canonical_key, sport_type, title, home_team, away_team, \
                 match_time, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(canonical_key) DO UPDATE SET \
                 title = excluded.title, \
                 home_team = excluded.home_team, \
                 away_team = excluded.away_team, \
                 match_time = excluded.match_time, \
                 status = excluded.status, \
                 updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(&c.canonical_key)
        .bind(&c.sport_type)
        .bind(&c.title)
        .bind(&c.home_team)
        .bind(&c.away_team)
        .bind(c.match_time)
        .bind(c.status)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Link `event_id` to a canonical. The link's platform is always taken
    /// from the event row, so a link can never name another venue.
    pub async fn upsert_link(&self, canonical_event_id: i64, event_id: i64) -> StoreResult<()> {
        let res = sqlx::query(
            "INSERT INTO event_platform_links (canonical_event_id, platform_id, event_id, updated_at) \
             SELECT ?, platform_id, id, ? FROM events WHERE id = ? \
             ON CONFLICT(canonical_event_id, platform_id) DO UPDATE SET \
                 event_id = excluded.event_id, \
                 updated_at = excluded.updated_at",
        )
        .bind(canonical_event_id)
        .bind(Utc::now())
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("event {event_id} not found")));
        }
        Ok(())
    }

    pub async fn get_canonical(&self, id: i64) -> StoreResult<Option<CanonicalEvent>> {
        let row = sqlx::query_as::<_, CanonicalEvent>("SELECT * FROM canonical_events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_canonical_by_key(&self, key: &str) -> StoreResult<Option<CanonicalEvent>> {
        let row = sqlx::query_as::<_, CanonicalEvent>(
            "SELECT * FROM canonical_events WHERE canonical_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Canonical grouping `event_id`, if any.
    pub async fn canonical_for_event(&self, event_id: i64) -> StoreResult<Option<CanonicalEvent>> {
        let row = sqlx::query_as::<_, CanonicalEvent>(
            "SELECT c.* FROM canonical_events c \
             JOIN event_platform_links l ON l.canonical_event_id = c.id \
             WHERE l.event_id = ? ORDER BY c.updated_at DESC LIMIT 1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn links_for_canonical(&self, canonical_event_id: i64) -> StoreResult<Vec<EventPlatformLink>> {
        let rows = sqlx::query_as::<_, EventPlatformLink>(
            "SELECT * FROM event_platform_links WHERE canonical_event_id = ? ORDER BY platform_id",
        )
        .bind(canonical_event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// One page of canonicals, newest match first, with the total count.
    pub async fn list_canonicals(
        &self,
        filter: &CanonicalFilter,
        page: Page,
    ) -> StoreResult<(Vec<CanonicalEvent>, i64)> {
        let mut count: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM canonical_events WHERE 1 = 1");
        push_filter(&mut count, filter);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM canonical_events WHERE 1 = 1");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY match_time DESC, id DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows = qb.build_query_as::<CanonicalEvent>().fetch_all(&self.pool).await?;
        Ok((rows, total))
    }

    /// Remove a canonical and its links; the grouped events are kept.
    pub async fn delete_canonical(&self, id: i64) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM canonical_events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &CanonicalFilter) {
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(sport) = filter.sport_type.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND sport_type = ").push_bind(sport.to_string());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
