//! SQLite schema.
//!
//! Every uniqueness rule of the data model is a constraint here; the store
//! relies on them for idempotent upserts.

pub const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS platforms (
        id          INTEGER PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        enabled     INTEGER NOT NULL DEFAULT 1,
        created_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        event_uuid         TEXT NOT NULL UNIQUE,
        platform_id        INTEGER NOT NULL REFERENCES platforms(id),
        platform_event_id  TEXT NOT NULL,
        title              TEXT NOT NULL,
        event_type         TEXT NOT NULL,
        start_time         TEXT NOT NULL,
        end_time           TEXT,
        status             TEXT NOT NULL,
        options            TEXT NOT NULL DEFAULT '[]',
        result             TEXT,
        result_source      TEXT,
        result_checked_at  TEXT,
        created_at         TEXT NOT NULL,
        updated_at         TEXT NOT NULL,
        UNIQUE (platform_id, platform_event_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_type_status ON events (event_type, status)",
    "CREATE TABLE IF NOT EXISTS odds (
        id                     INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id               INTEGER NOT NULL REFERENCES events(id),
        platform_id            INTEGER NOT NULL,
        platform_event_id      TEXT NOT NULL,
        option_name            TEXT NOT NULL CHECK (length(option_name) > 0),
        option_type            TEXT NOT NULL,
        price                  REAL NOT NULL CHECK (price >= 0 AND price <= 1),
        unique_event_platform  TEXT NOT NULL UNIQUE,
        updated_at             TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_odds_event ON odds (event_id)",
    "CREATE TABLE IF NOT EXISTS canonical_events (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        canonical_key  TEXT NOT NULL UNIQUE,
        sport_type     TEXT NOT NULL,
        title          TEXT NOT NULL,
        home_team      TEXT NOT NULL DEFAULT '',
        away_team      TEXT NOT NULL DEFAULT '',
        match_time     TEXT NOT NULL,
        status         TEXT NOT NULL,
        created_at     TEXT NOT NULL,
        updated_at     TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_canonical_status ON canonical_events (sport_type, status)",
    "CREATE TABLE IF NOT EXISTS event_platform_links (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        canonical_event_id  INTEGER NOT NULL REFERENCES canonical_events(id) ON DELETE CASCADE,
        platform_id         INTEGER NOT NULL,
        event_id            INTEGER NOT NULL REFERENCES events(id),
        updated_at          TEXT NOT NULL,
        UNIQUE (canonical_event_id, platform_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_links_event ON event_platform_links (event_id)",
    "CREATE TABLE IF NOT EXISTS contract_events (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        tx_hash            TEXT NOT NULL UNIQUE,
        block_number       INTEGER NOT NULL DEFAULT 0,
        event_type         TEXT NOT NULL,
        contract_order_id  TEXT NOT NULL,
        user_wallet        TEXT NOT NULL DEFAULT '',
        deposit_amount     REAL NOT NULL DEFAULT 0,
        fund_currency      TEXT NOT NULL DEFAULT 'USDC',
        processed          INTEGER NOT NULL DEFAULT 0,
        refunded_at        TEXT,
        created_at         TEXT NOT NULL,
        CHECK (NOT (processed = 1 AND refunded_at IS NOT NULL))
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_contract_events_deposit
        ON contract_events (contract_order_id) WHERE event_type = 'DepositSuccess'",
    "CREATE TABLE IF NOT EXISTS orders (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        order_uuid          TEXT NOT NULL UNIQUE,
        user_wallet         TEXT NOT NULL,
        event_id            INTEGER NOT NULL REFERENCES events(id),
        platform_id         INTEGER NOT NULL,
        platform_order_id   TEXT NOT NULL,
        bet_option          TEXT NOT NULL,
        bet_amount          REAL NOT NULL,
        fund_currency       TEXT NOT NULL,
        locked_odds         REAL NOT NULL,
        expected_profit     REAL NOT NULL DEFAULT 0,
        actual_profit       REAL NOT NULL DEFAULT 0,
        status              TEXT NOT NULL,
        settlement_tx_hash  TEXT,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_orders_wallet ON orders (user_wallet COLLATE NOCASE, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_orders_event ON orders (event_id, status)",
    "CREATE TABLE IF NOT EXISTS settlement_records (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        tx_hash            TEXT NOT NULL UNIQUE,
        order_uuid         TEXT NOT NULL UNIQUE REFERENCES orders(order_uuid),
        settlement_amount  REAL NOT NULL,
        manage_fee         REAL NOT NULL DEFAULT 0,
        gas_fee            REAL NOT NULL DEFAULT 0,
        created_at         TEXT NOT NULL
    )",
];
