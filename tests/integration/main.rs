//! End-to-end tests: mock venues behind the real store, engine and API.

mod ingest_flow;
mod mock_platform;
mod order_flow;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use mock_platform::{listing, MockVenue};
use venue_router::api::{build_router, ApiState};
use venue_router::chain::escrow::FundsReleaser;
use venue_router::chain::listener::dispatch;
use venue_router::chain::{decode_log, funds_locked_topic, settled_topic};
use venue_router::engine::coordinator::OrderCoordinator;
use venue_router::engine::sync::SyncService;
use venue_router::fiat::StablecoinParity;
use venue_router::platforms::VenueRegistry;
use venue_router::storage::Store;
use venue_router::types::AppError;

pub const MATCH_START: &str = "2026-07-01T19:00:00Z";

/// Records release calls instead of touching a chain.
#[derive(Default)]
pub struct RecordingReleaser {
    pub calls: Mutex<Vec<(B256, Address, U256)>>,
}

#[async_trait]
impl FundsReleaser for RecordingReleaser {
    async fn release_funds(
        &self,
        bet_id: B256,
        to: Address,
        amount: U256,
        _cancel: CancellationToken,
    ) -> Result<String, AppError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push((bet_id, to, amount));
        Ok(format!("0x{:064x}", calls.len()))
    }
}

pub struct Harness {
    pub store: Store,
    pub poly: Arc<MockVenue>,
    pub kalshi: Arc<MockVenue>,
    pub coordinator: OrderCoordinator,
    pub sync: SyncService,
    pub releaser: Arc<RecordingReleaser>,
    pub app: axum::Router,
}

impl Harness {
    pub async fn new() -> Self {
        let poly = MockVenue::new(
            1,
            "polymarket",
            vec![
                listing("p1", "Lakers vs Celtics!", MATCH_START, ["Lakers", "Celtics"]),
                listing("p2", "Knicks vs Heat", "2026-07-02T00:00:00Z", ["Knicks", "Heat"]),
                listing("p3", "Suns vs Jazz", "2026-07-03T00:00:00Z", ["Suns", "Jazz"]),
            ],
        );
        let kalshi = MockVenue::new(
            2,
            "kalshi",
            vec![listing("K1", "lakers vs celtics", MATCH_START, ["YES", "NO"])],
        );
        Self::with_venues(poly, kalshi).await
    }

    pub async fn with_venues(poly: MockVenue, kalshi: MockVenue) -> Self {
        let store = Store::in_memory().await.unwrap();
        let poly = Arc::new(poly);
        let kalshi = Arc::new(kalshi);
        let mut registry = VenueRegistry::new();
        registry.insert(poly.clone());
        registry.insert(kalshi.clone());

        let releaser = Arc::new(RecordingReleaser::default());
        let coordinator = OrderCoordinator::new(store.clone(), registry.clone(), Arc::new(StablecoinParity))
            .with_releaser(releaser.clone())
            .with_settlement_contract(Some("0x00000000000000000000000000000000000000e6".into()));
        let sync = SyncService::new(store.clone(), registry, vec![]);
        let state = Arc::new(ApiState {
            store: store.clone(),
            coordinator: coordinator.clone(),
            sync: sync.clone(),
            cancel: CancellationToken::new(),
        });
        let app = build_router(state, &["*".to_string()]);
        Self {
            store,
            poly,
            kalshi,
            coordinator,
            sync,
            releaser,
            app,
        }
    }

    /// Ingest both venues through the API.
    pub async fn ingest(&self) {
        for venue in ["polymarket", "kalshi"] {
            let (status, body) = self
                .request("POST", &format!("/sync/platform/{venue}?type=sports"), None)
                .await;
            assert_eq!(status, StatusCode::OK, "{body}");
        }
    }

    pub async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = self.app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Feed a `FundsLocked` log through the decoder to the coordinator.
    pub async fn deliver_deposit(&self, bet_id: B256, from: Address, units: u64, tx: u8) -> Result<(), AppError> {
        let mut data = vec![0u8; 12];
        data.extend_from_slice(from.as_slice());
        data.extend_from_slice(&U256::from(units).to_be_bytes::<32>());
        let event = decode_log(&[funds_locked_topic(), bet_id], &data, Some(B256::repeat_byte(tx)), Some(100))?
            .expect("deposit log decodes");
        dispatch(&self.coordinator, event).await
    }

    /// Feed a `Settled` log through the decoder to the coordinator.
    pub async fn deliver_settled(&self, bet_id: B256, payout_units: u64, fee_units: u64, tx: u8) -> Result<(), AppError> {
        let mut data = U256::from(payout_units).to_be_bytes::<32>().to_vec();
        data.extend_from_slice(&U256::from(fee_units).to_be_bytes::<32>());
        let event = decode_log(&[settled_topic(), bet_id], &data, Some(B256::repeat_byte(tx)), Some(200))?
            .expect("settled log decodes");
        dispatch(&self.coordinator, event).await
    }

    pub async fn count(&self, table: &str) -> i64 {
        let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.store.pool())
            .await
            .unwrap();
        n
    }
}

/// The 64-hex order id of a bet id.
pub fn order_id(bet_id: B256) -> String {
    hex::encode(bet_id)
}
