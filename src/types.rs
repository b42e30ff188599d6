//! Shared types for the venue router.
//!
//! These types mirror the relational schema owned by the store: venue
//! events and their odds, canonical events grouping one real-world match
//! across venues, and the escrow-side contract events, orders and
//! settlement records. Venue adapters, the engine and the HTTP layer all
//! depend on this module and nothing else in the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Seeded platform id of the order-book venue (Gamma + CLOB).
pub const PLATFORM_POLYMARKET: i64 = 1;
/// Seeded platform id of the YES/NO contract venue (Trade API).
pub const PLATFORM_KALSHI: i64 = 2;

pub const POLYMARKET: &str = "polymarket";
pub const KALSHI: &str = "kalshi";

/// Escrow amounts are 6-decimal USDC on chain.
pub const USDC_DECIMALS: u32 = 6;

/// Allowed drift between a request amount and the deposited amount.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

pub const DEFAULT_EVENT_TYPE: &str = "sports";

/// Deterministic surrogate key of an event.
pub fn event_uuid(platform_id: i64, platform_event_id: &str) -> String {
    format!("{platform_id}_{platform_event_id}")
}

/// Unique key of an odds row.
pub fn unique_event_platform(platform_id: i64, platform_event_id: &str, option_name: &str) -> String {
    format!("{platform_id}_{platform_event_id}_{option_name}")
}

/// Expected profit of a bet of `amount` at `price`.
///
/// Prices above 1 are treated as decimal odds; probability prices pay
/// `1/price - 1` per unit staked.
pub fn expected_profit(amount: f64, price: f64) -> f64 {
    let edge = price - 1.0;
    if edge > 0.0 {
        amount * edge
    } else if price > 0.0 {
        amount * (1.0 / price - 1.0)
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Canonical lifecycle of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EventStatus {
    Active,
    Resolved,
    Canceled,
}

impl EventStatus {
    /// Map a venue status string to the canonical status.
    ///
    /// `open` is active, `closed` is resolved, anything else is canceled.
    /// Adapters normalise their own vocabulary to `open`/`closed` first.
    pub fn from_venue(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "open" => EventStatus::Active,
            "closed" => EventStatus::Resolved,
            _ => EventStatus::Canceled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Active => "active",
            EventStatus::Resolved => "resolved",
            EventStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(EventStatus::Active),
            "resolved" => Ok(EventStatus::Resolved),
            "canceled" | "cancelled" => Ok(EventStatus::Canceled),
            _ => Err(AppError::InvalidInput(format!("unknown event status: {s}"))),
        }
    }
}

/// Normalised outcome role, used to match YES/NO bets against venues
/// that expose named outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OptionType {
    Win,
    Draw,
    Lose,
}

impl OptionType {
    /// Classify an outcome by label, falling back to its position within
    /// the market: first wins, last loses, anything in between draws.
    pub fn classify(option_name: &str, index: usize, count: usize) -> Self {
        match option_name.trim().to_lowercase().as_str() {
            "yes" => OptionType::Win,
            "no" => OptionType::Lose,
            "draw" | "tie" => OptionType::Draw,
            _ if index == 0 => OptionType::Win,
            _ if index + 1 == count => OptionType::Lose,
            _ => OptionType::Draw,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Win => "win",
            OptionType::Draw => "draw",
            OptionType::Lose => "lose",
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPlace,
    Placed,
    Settlable,
    Settled,
    WithdrawRequested,
    Withdrawn,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPlace => "pending_place",
            OrderStatus::Placed => "placed",
            OrderStatus::Settlable => "settlable",
            OrderStatus::Settled => "settled",
            OrderStatus::WithdrawRequested => "withdraw_requested",
            OrderStatus::Withdrawn => "withdrawn",
        }
    }

    /// Whether an on-chain settlement may land on an order in this state.
    pub fn accepts_settlement(&self) -> bool {
        matches!(
            self,
            OrderStatus::Placed | OrderStatus::Settlable | OrderStatus::Settled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending_place" => Ok(OrderStatus::PendingPlace),
            "placed" => Ok(OrderStatus::Placed),
            "settlable" => Ok(OrderStatus::Settlable),
            "settled" => Ok(OrderStatus::Settled),
            "withdraw_requested" => Ok(OrderStatus::WithdrawRequested),
            "withdrawn" => Ok(OrderStatus::Withdrawn),
            _ => Err(AppError::InvalidInput(format!("unknown order status: {s}"))),
        }
    }
}

/// Kind of an on-chain escrow log persisted as a contract event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum ContractEventKind {
    DepositSuccess,
    BetPlaced,
    Settled,
}

impl fmt::Display for ContractEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractEventKind::DepositSuccess => write!(f, "DepositSuccess"),
            ContractEventKind::BetPlaced => write!(f, "BetPlaced"),
            ContractEventKind::Settled => write!(f, "Settled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Venue rows
// ---------------------------------------------------------------------------

/// A venue seeded at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Platform {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// An event as listed by one venue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub event_uuid: String,
    pub platform_id: i64,
    pub platform_event_id: String,
    pub title: String,
    pub event_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: EventStatus,
    /// JSON array of option names.
    pub options: String,
    pub result: Option<String>,
    pub result_source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Last observed price of one outcome on one venue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Odds {
    pub id: i64,
    pub event_id: i64,
    pub platform_id: i64,
    pub platform_event_id: String,
    pub option_name: String,
    pub option_type: OptionType,
    pub price: f64,
    pub unique_event_platform: String,
    pub updated_at: DateTime<Utc>,
}

/// Event fields produced by conversion, before the store assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_uuid: String,
    pub platform_id: i64,
    pub platform_event_id: String,
    pub title: String,
    pub event_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub options: Vec<String>,
    pub result: Option<String>,
    pub result_source: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Odds fields produced by conversion or a live fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOdds {
    pub platform_id: i64,
    pub platform_event_id: String,
    pub option_name: String,
    pub option_type: OptionType,
    pub price: f64,
    pub unique_event_platform: String,
    pub updated_at: DateTime<Utc>,
}

impl NewOdds {
    pub fn new(
        platform_id: i64,
        platform_event_id: &str,
        option_name: &str,
        option_type: OptionType,
        price: f64,
    ) -> Self {
        Self {
            platform_id,
            platform_event_id: platform_event_id.to_string(),
            option_name: option_name.to_string(),
            option_type,
            price: if price.is_finite() { price.clamp(0.0, 1.0) } else { 0.0 },
            unique_event_platform: unique_event_platform(platform_id, platform_event_id, option_name),
            updated_at: Utc::now(),
        }
    }
}

/// One converted event with all of its odds rows.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event: NewEvent,
    pub odds: Vec<NewOdds>,
}

// ---------------------------------------------------------------------------
// Raw venue model
// ---------------------------------------------------------------------------

/// Venue-neutral shape of a raw listing, before truncation and parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEvent {
    pub platform_event_id: String,
    pub title: String,
    pub event_type: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// Venue status, already normalised to `open` / `closed` where known.
    pub status: String,
    pub markets: Vec<RawMarket>,
    pub result: Option<String>,
    pub result_source: Option<String>,
}

/// One venue market: outcome labels zipped by index with their prices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMarket {
    pub market_id: String,
    pub outcomes: Vec<String>,
    pub prices: Vec<f64>,
}

/// Outcome of a result lookup against a venue.
#[derive(Debug, Clone, PartialEq)]
pub struct EventResult {
    pub status: EventStatus,
    pub result: Option<String>,
    pub result_source: String,
}

// ---------------------------------------------------------------------------
// Canonical rows
// ---------------------------------------------------------------------------

/// One real-world match, deduplicated across venues.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CanonicalEvent {
    pub id: i64,
    pub canonical_key: String,
    pub sport_type: String,
    pub title: String,
    pub home_team: String,
    pub away_team: String,
    pub match_time: DateTime<Utc>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCanonicalEvent {
    pub canonical_key: String,
    pub sport_type: String,
    pub title: String,
    pub home_team: String,
    pub away_team: String,
    pub match_time: DateTime<Utc>,
    pub status: EventStatus,
}

/// Link from a canonical event to the event a venue lists for it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventPlatformLink {
    pub id: i64,
    pub canonical_event_id: i64,
    pub platform_id: i64,
    pub event_id: i64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Escrow rows
// ---------------------------------------------------------------------------

/// A decoded escrow log.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContractEvent {
    pub id: i64,
    pub tx_hash: String,
    pub block_number: i64,
    pub event_type: ContractEventKind,
    pub contract_order_id: String,
    pub user_wallet: String,
    pub deposit_amount: f64,
    pub fund_currency: String,
    pub processed: bool,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ContractEvent {
    pub fn is_refunded(&self) -> bool {
        self.refunded_at.is_some()
    }
}

/// A `FundsLocked` observation waiting to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeposit {
    pub tx_hash: String,
    pub block_number: i64,
    pub contract_order_id: String,
    pub user_wallet: String,
    pub deposit_amount: f64,
    pub fund_currency: String,
}

/// A bet relayed to a venue on behalf of a depositor.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub order_uuid: String,
    pub user_wallet: String,
    pub event_id: i64,
    pub platform_id: i64,
    pub platform_order_id: String,
    pub bet_option: String,
    pub bet_amount: f64,
    pub fund_currency: String,
    pub locked_odds: f64,
    pub expected_profit: f64,
    pub actual_profit: f64,
    pub status: OrderStatus,
    pub settlement_tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub order_uuid: String,
    pub user_wallet: String,
    pub event_id: i64,
    pub platform_id: i64,
    pub platform_order_id: String,
    pub bet_option: String,
    pub bet_amount: f64,
    pub fund_currency: String,
    pub locked_odds: f64,
    pub expected_profit: f64,
}

/// One settled order's payout breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SettlementRecord {
    pub id: i64,
    pub tx_hash: String,
    pub order_uuid: String,
    pub settlement_amount: f64,
    pub manage_fee: f64,
    pub gas_fee: f64,
    pub created_at: DateTime<Utc>,
}

/// Settlement notification delivered by the chain listener.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementNotice {
    pub order_uuid: String,
    pub tx_hash: String,
    pub settlement_amount: f64,
    pub manage_fee: f64,
    pub gas_fee: f64,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Error kinds surfaced by the core.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("venue error ({venue}): {message}")]
    UpstreamVenue { venue: String, message: String },

    #[error("chain error: {0}")]
    UpstreamChain(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl AppError {
    pub fn venue(venue: &str, err: impl fmt::Display) -> Self {
        AppError::UpstreamVenue {
            venue: venue.to_string(),
            message: err.to_string(),
        }
    }

    /// Stable machine-readable kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::UpstreamVenue { .. } => "upstream_venue",
            AppError::UpstreamChain(_) => "upstream_chain",
            AppError::Store(_) => "internal_store",
            AppError::Internal(_) => "internal",
            AppError::Cancelled => "cancelled",
        }
    }

    /// Errors the caller can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidInput(_) | AppError::NotFound(_) | AppError::Conflict(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
