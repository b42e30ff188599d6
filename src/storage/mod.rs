//! Persistence layer.
//!
//! A SQLite-backed store owning every row in the system. Correctness under
//! concurrent callers comes from the schema's unique constraints and
//! conditional updates, never from in-process locks. Each entity family
//! lives in its own submodule as an `impl Store` block.

pub mod canonical;
pub mod events;
pub mod orders;
pub mod schema;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::types::{AppError, Platform, KALSHI, PLATFORM_KALSHI, PLATFORM_POLYMARKET, POLYMARKET};

pub use canonical::CanonicalFilter;
pub use events::UpsertStats;
pub use orders::SettlementOutcome;

pub type StoreResult<T> = std::result::Result<T, AppError>;

/// Platforms seeded at bootstrap with fixed ids.
pub const SEEDED_PLATFORMS: &[(i64, &str)] = &[
    (PLATFORM_POLYMARKET, POLYMARKET),
    (PLATFORM_KALSHI, KALSHI),
];

/// Page request shared by list queries. Pages start at 1.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub const MAX_SIZE: u32 = 100;
    pub const DEFAULT_SIZE: u32 = 20;

    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(Self::DEFAULT_SIZE)
                .clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.page_size as i64
    }
}

/// Handle to the process-wide connection pool. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the pool described by `cfg`, create the schema and seed platforms.
    pub async fn connect(cfg: &DatabaseConfig) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&cfg.dsn)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.max_open_conns.max(1))
            .min_connections(cfg.max_idle_conns.min(cfg.max_open_conns))
            .max_lifetime(Duration::from_secs(cfg.conn_max_lifetime_sec.max(1)))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        store.seed_platforms().await?;
        info!(dsn = %cfg.dsn, max_open = cfg.max_open_conns, "Store ready");
        Ok(store)
    }

    /// A private in-memory database, for tests and dry runs.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Every connection to :memory: is a separate database, so pin one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        store.seed_platforms().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        for stmt in schema::STATEMENTS {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        debug!(statements = schema::STATEMENTS.len(), "Schema applied");
        Ok(())
    }

    pub async fn seed_platforms(&self) -> StoreResult<()> {
        for (id, name) in SEEDED_PLATFORMS {
            sqlx::query(
                "INSERT INTO platforms (id, name, enabled, created_at) VALUES (?, ?, 1, ?) \
                 ON CONFLICT(name) DO NOTHING",
            )
            .bind(*id)
            .bind(*name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- Platforms -------------------------------------------------------

    pub async fn get_platform_by_name(&self, name: &str) -> StoreResult<Option<Platform>> {
        let row = sqlx::query_as::<_, Platform>("SELECT * FROM platforms WHERE name = ?")
            .bind(name.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_platform(&self, id: i64) -> StoreResult<Option<Platform>> {
        let row = sqlx::query_as::<_, Platform>("SELECT * FROM platforms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_platforms(&self) -> StoreResult<Vec<Platform>> {
        let rows = sqlx::query_as::<_, Platform>("SELECT * FROM platforms ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn set_platform_enabled(&self, name: &str, enabled: bool) -> StoreResult<bool> {
        let res = sqlx::query("UPDATE platforms SET enabled = ? WHERE name = ?")
            .bind(enabled)
            .bind(name.to_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
