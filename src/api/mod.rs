//! HTTP API: axum server for market reads and the order lifecycle.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

pub use routes::{ApiState, AppState};

/// CORS policy from `server.cors_allow_origins`; `*` allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow = if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match o.trim().parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };
    CorsLayer::new()
        .allow_origin(allow)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/sync/platform/:platform", post(routes::sync_platform))
        .route("/api/markets", get(routes::list_markets))
        .route("/api/markets/:id", get(routes::get_market))
        .route("/api/orders", get(routes::list_orders))
        .route("/api/orders/prepare", post(routes::prepare_order))
        .route("/api/orders/place", post(routes::place_order))
        .route("/api/orders/unfreeze", post(routes::unfreeze_order))
        .route("/api/orders/:order_uuid", get(routes::get_order))
        .route("/api/orders/:order_uuid/withdraw-info", get(routes::withdraw_info))
        .route("/api/orders/:order_uuid/withdraw", post(routes::request_withdraw))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn serve(port: u16, app: Router, cancel: CancellationToken) -> Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    info!(port, "API server listening on http://localhost:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("API server error")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
