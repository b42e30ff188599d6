//! API route handlers.
//!
//! All endpoints return JSON with times as integer milliseconds. Errors
//! are `{"error": msg}`: 400 for problems the caller can fix, 500 for
//! everything else.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::chain::normalize_order_id;
use crate::engine::coordinator::{
    OrderCoordinator, PlaceRequest, PlacedOrder, PrepareRequest, PreparedOrder, UnfreezeReceipt,
    UnfreezeRequest, WithdrawInfo, WithdrawOutcome,
};
use crate::engine::router::ResolvedMatch;
use crate::engine::sync::SyncService;
use crate::storage::{CanonicalFilter, Page, Store};
use crate::types::{AppError, CanonicalEvent, Event, Odds, Order, OrderStatus, DEFAULT_EVENT_TYPE};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ApiState {
    pub store: Store,
    pub coordinator: OrderCoordinator,
    pub sync: SyncService,
    /// Cancels on-demand ingest runs at shutdown.
    pub cancel: CancellationToken,
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| AppError::InvalidInput(rejection.body_text()))
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OddsView {
    pub option_name: String,
    pub option_type: String,
    pub price: f64,
    pub updated_at: i64,
}

impl From<&Odds> for OddsView {
    fn from(o: &Odds) -> Self {
        Self {
            option_name: o.option_name.clone(),
            option_type: o.option_type.as_str().to_string(),
            price: o.price,
            updated_at: millis(o.updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VenueView {
    pub platform_id: i64,
    pub event_uuid: String,
    pub platform_event_id: String,
    pub title: String,
    pub status: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub result: Option<String>,
    pub odds: Vec<OddsView>,
}

impl VenueView {
    fn new(event: &Event, odds: &[Odds]) -> Self {
        Self {
            platform_id: event.platform_id,
            event_uuid: event.event_uuid.clone(),
            platform_event_id: event.platform_event_id.clone(),
            title: event.title.clone(),
            status: event.status.as_str().to_string(),
            start_time: millis(event.start_time),
            end_time: event.end_time.map(millis),
            result: event.result.clone(),
            odds: odds.iter().map(OddsView::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketView {
    /// Canonical id; absent for a single-venue market.
    pub id: Option<i64>,
    pub canonical_key: Option<String>,
    pub sport_type: String,
    pub title: String,
    pub home_team: String,
    pub away_team: String,
    pub match_time: i64,
    pub status: String,
    pub venues: Vec<VenueView>,
}

impl MarketView {
    fn build(canonical: Option<&CanonicalEvent>, events: &[Event], odds: &[Odds]) -> Option<Self> {
        let mut by_event: HashMap<i64, Vec<Odds>> = HashMap::new();
        for o in odds {
            by_event.entry(o.event_id).or_default().push(o.clone());
        }
        let venues = events
            .iter()
            .map(|e| VenueView::new(e, by_event.get(&e.id).map(Vec::as_slice).unwrap_or(&[])))
            .collect();
        match canonical {
            Some(c) => Some(Self {
                id: Some(c.id),
                canonical_key: Some(c.canonical_key.clone()),
                sport_type: c.sport_type.clone(),
                title: c.title.clone(),
                home_team: c.home_team.clone(),
                away_team: c.away_team.clone(),
                match_time: millis(c.match_time),
                status: c.status.as_str().to_string(),
                venues,
            }),
            None => {
                let e = events.first()?;
                Some(Self {
                    id: None,
                    canonical_key: None,
                    sport_type: e.event_type.clone(),
                    title: e.title.clone(),
                    home_team: String::new(),
                    away_team: String::new(),
                    match_time: millis(e.start_time),
                    status: e.status.as_str().to_string(),
                    venues,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
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
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<Order> for OrderView {
    fn from(o: Order) -> Self {
        Self {
            created_at: millis(o.created_at),
            updated_at: millis(o.updated_at),
            order_uuid: o.order_uuid,
            user_wallet: o.user_wallet,
            event_id: o.event_id,
            platform_id: o.platform_id,
            platform_order_id: o.platform_order_id,
            bet_option: o.bet_option,
            bet_amount: o.bet_amount,
            fund_currency: o.fund_currency,
            locked_odds: o.locked_odds,
            expected_profit: o.expected_profit,
            actual_profit: o.actual_profit,
            status: o.status,
            settlement_tx_hash: o.settlement_tx_hash,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageView<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub platform: String,
    pub event_type: String,
    pub events: usize,
    pub skipped_chunks: usize,
    pub events_inserted: usize,
    pub events_updated: usize,
    pub odds_changed: usize,
    pub canonicals: usize,
    pub links: usize,
    pub elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Query strings
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarketQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub sport_type: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrderQuery {
    pub wallet: Option<String>,
    pub status: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /sync/platform/:platform
pub async fn sync_platform(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Query(q): Query<SyncQuery>,
) -> ApiResult<SyncResponse> {
    let event_type = non_empty(q.event_type.as_deref())
        .unwrap_or(DEFAULT_EVENT_TYPE)
        .to_string();
    let report = state
        .sync
        .sync_platform(&platform, &event_type, &state.cancel)
        .await?;
    let up = report.ingest.upserts;
    Ok(Json(SyncResponse {
        platform: report.ingest.platform,
        event_type,
        events: report.ingest.stream.events,
        skipped_chunks: report.ingest.stream.skipped_chunks,
        events_inserted: up.events_inserted,
        events_updated: up.events_updated,
        odds_changed: up.odds_inserted + up.odds_updated,
        canonicals: report.aggregate.canonicals,
        links: report.aggregate.links,
        elapsed_ms: report.ingest.elapsed_ms as u64,
    }))
}

/// GET /api/markets
pub async fn list_markets(
    State(state): State<AppState>,
    Query(q): Query<MarketQuery>,
) -> ApiResult<PageView<MarketView>> {
    let filter = CanonicalFilter {
        status: non_empty(q.status.as_deref()).map(str::parse).transpose()?,
        sport_type: non_empty(q.sport_type.as_deref()).map(String::from),
    };
    let page = Page::new(q.page, q.page_size);
    let (canonicals, total) = state.store.list_canonicals(&filter, page).await?;

    let mut items = Vec::with_capacity(canonicals.len());
    for c in &canonicals {
        let mut events = Vec::new();
        for link in state.store.links_for_canonical(c.id).await? {
            match state.store.get_event(link.event_id).await? {
                Some(e) => events.push(e),
                None => warn!(canonical = c.id, event_id = link.event_id, "Dangling platform link"),
            }
        }
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let odds = state.store.odds_for_events(&ids).await?;
        items.extend(MarketView::build(Some(c), &events, &odds));
    }
    Ok(Json(PageView {
        items,
        total,
        page: page.page,
        page_size: page.page_size,
    }))
}

/// GET /api/markets/:id
pub async fn get_market(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<MarketView> {
    let ResolvedMatch {
        event,
        canonical,
        linked,
    } = state.coordinator.router().resolve(&id).await?;
    let ids: Vec<i64> = linked.iter().map(|e| e.id).collect();
    let odds = state.store.odds_for_events(&ids).await?;
    MarketView::build(canonical.as_ref(), &linked, &odds)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("market {} has no venues", event.event_uuid)))
}

/// GET /api/orders
pub async fn list_orders(
    State(state): State<AppState>,
    Query(q): Query<OrderQuery>,
) -> ApiResult<PageView<OrderView>> {
    let wallet = non_empty(q.wallet.as_deref())
        .ok_or_else(|| AppError::InvalidInput("wallet is required".into()))?;
    let status: Option<OrderStatus> = non_empty(q.status.as_deref()).map(str::parse).transpose()?;
    let page = Page::new(q.page, q.page_size);
    let (orders, total) = state.store.list_orders_by_wallet(wallet, status, page).await?;
    Ok(Json(PageView {
        items: orders.into_iter().map(OrderView::from).collect(),
        total,
        page: page.page,
        page_size: page.page_size,
    }))
}

/// GET /api/orders/:order_uuid
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_uuid): Path<String>,
) -> ApiResult<OrderView> {
    let uuid = normalize_order_id(&order_uuid)?;
    let order = state
        .store
        .get_order(&uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {uuid} not found")))?;
    Ok(Json(order.into()))
}

/// POST /api/orders/prepare
pub async fn prepare_order(
    State(state): State<AppState>,
    payload: Result<Json<PrepareRequest>, JsonRejection>,
) -> ApiResult<PreparedOrder> {
    let req = body(payload)?;
    Ok(Json(state.coordinator.prepare(&req).await?))
}

/// POST /api/orders/place
pub async fn place_order(
    State(state): State<AppState>,
    payload: Result<Json<PlaceRequest>, JsonRejection>,
) -> ApiResult<PlacedOrder> {
    let req = body(payload)?;
    Ok(Json(state.coordinator.place(&req).await?))
}

/// POST /api/orders/unfreeze
pub async fn unfreeze_order(
    State(state): State<AppState>,
    payload: Result<Json<UnfreezeRequest>, JsonRejection>,
) -> ApiResult<UnfreezeReceipt> {
    let req = body(payload)?;
    Ok(Json(state.coordinator.unfreeze(&req).await?))
}

/// GET /api/orders/:order_uuid/withdraw-info
pub async fn withdraw_info(
    State(state): State<AppState>,
    Path(order_uuid): Path<String>,
) -> ApiResult<WithdrawInfo> {
    Ok(Json(state.coordinator.get_withdraw_info(&order_uuid).await?))
}

/// POST /api/orders/:order_uuid/withdraw
pub async fn request_withdraw(
    State(state): State<AppState>,
    Path(order_uuid): Path<String>,
) -> ApiResult<WithdrawOutcome> {
    Ok(Json(state.coordinator.request_withdraw(&order_uuid).await?))
}
