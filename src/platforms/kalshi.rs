//! Kalshi integration.
//!
//! Trade API v2: sports series discovery, nested-market event listing,
//! per-market prices and results, and portfolio order entry. Authenticated
//! requests are signed with RSA-PSS over `timestamp + method + path`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::CONTENT_TYPE;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::BlindedSigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::PlatformConfig;
use crate::platforms::http::{build_client, de_opt_f64, VenueHttp};
use crate::platforms::{
    deliver_chunk, BatchSink, PlaceOrderReceipt, PlaceOrderRequest, SeenEvents, StreamStats,
    TradingVenue, VenueAdapter,
};
use crate::types::{
    EventResult, EventStatus, NewOdds, OptionType, RawEvent, RawMarket, KALSHI, PLATFORM_KALSHI,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const TRADE_API_URL: &str = "https://api.elections.kalshi.com/trade-api/v2";
const SPORTS_CATEGORY: &str = "Sports";
const SERIES_CACHE_TTL: Duration = Duration::from_secs(4 * 3600);
const PAGE_LIMIT: u32 = 200;
const MAX_PAGES: usize = 50;

// ---------------------------------------------------------------------------
// Trade API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    #[serde(default)]
    series: Option<Vec<KalshiSeries>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KalshiSeries {
    #[serde(default)]
    pub ticker: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    events: Vec<KalshiEvent>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KalshiEvent {
    #[serde(default)]
    pub event_ticker: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub strike_date: Option<String>,
    #[serde(default)]
    pub markets: Vec<KalshiMarket>,
}

#[derive(Debug, Deserialize)]
struct MarketResponse {
    market: KalshiMarket,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KalshiMarket {
    #[serde(default)]
    pub ticker: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub yes_ask_dollars: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub no_ask_dollars: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub last_price_dollars: Option<f64>,
    #[serde(default)]
    pub open_time: Option<String>,
    #[serde(default)]
    pub close_time: Option<String>,
    #[serde(default)]
    pub expected_expiration_time: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

impl KalshiMarket {
    /// YES/NO prices: asks first, last trade as the fallback.
    pub fn yes_no_prices(&self) -> (f64, f64) {
        let yes = self.yes_ask_dollars.or(self.last_price_dollars);
        let no = self
            .no_ask_dollars
            .or_else(|| self.last_price_dollars.map(|p| 1.0 - p));
        (yes.unwrap_or(0.0), no.unwrap_or(0.0))
    }

    fn normalised_status(&self) -> &'static str {
        match self.status.to_lowercase().as_str() {
            "active" | "open" | "initialized" => "open",
            "closed" | "settled" | "finalized" | "determined" => "closed",
            _ => "canceled",
        }
    }

    fn to_raw_market(&self) -> RawMarket {
        let (yes, no) = self.yes_no_prices();
        RawMarket {
            market_id: self.ticker.clone(),
            outcomes: vec!["YES".to_string(), "NO".to_string()],
            prices: vec![yes, no],
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    order: CreatedOrder,
}

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    status: String,
}

// ---------------------------------------------------------------------------
// Series cache
// ---------------------------------------------------------------------------

/// Sports series tickers, refreshed after `ttl`.
pub struct SeriesCache {
    ttl: Duration,
    inner: RwLock<Option<(Instant, Vec<String>)>>,
}

impl SeriesCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(None),
        }
    }

    /// Cached tickers if they were stored less than `ttl` before `now`.
    pub fn get_at(&self, now: Instant) -> Option<Vec<String>> {
        let guard = self.inner.read().ok()?;
        match guard.as_ref() {
            Some((stored, tickers)) if now.saturating_duration_since(*stored) < self.ttl => {
                Some(tickers.clone())
            }
            _ => None,
        }
    }

    pub fn put_at(&self, now: Instant, tickers: Vec<String>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some((now, tickers));
        }
    }
}

// ---------------------------------------------------------------------------
// Request signing
// ---------------------------------------------------------------------------

/// API key id plus its RSA private key.
pub struct KalshiSigner {
    key_id: String,
    signing_key: BlindedSigningKey<Sha256>,
}

impl std::fmt::Debug for KalshiSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiSigner")
            .field("key_id", &self.key_id)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl KalshiSigner {
    /// Load a PEM key in PKCS#1 or PKCS#8 form.
    pub fn from_pem(key_id: &str, pem: &str) -> Result<Self> {
        let pem = pem.trim().replace("\\n", "\n");
        let key = RsaPrivateKey::from_pkcs1_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
            .context("Kalshi private key is neither PKCS#1 nor PKCS#8 PEM")?;
        Ok(Self {
            key_id: key_id.to_string(),
            signing_key: BlindedSigningKey::<Sha256>::new(key),
        })
    }

    /// Base64 RSA-PSS(SHA-256) signature of `timestamp + method + path`.
    pub fn sign(&self, timestamp_ms: &str, method: &str, path: &str) -> String {
        let message = format!("{timestamp_ms}{}{path}", method.to_uppercase());
        let mut rng = rand::thread_rng();
        let signature = self.signing_key.sign_with_rng(&mut rng, message.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    pub fn headers(&self, method: &str, path: &str) -> [(&'static str, String); 3] {
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&timestamp, method, path);
        [
            ("KALSHI-ACCESS-KEY", self.key_id.clone()),
            ("KALSHI-ACCESS-TIMESTAMP", timestamp),
            ("KALSHI-ACCESS-SIGNATURE", signature),
        ]
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct KalshiClient {
    api: VenueHttp,
    configured_series: Vec<String>,
    series_cache: SeriesCache,
    signer: Option<KalshiSigner>,
}

impl KalshiClient {
    pub fn new(cfg: &PlatformConfig) -> Result<Self> {
        let http = build_client(KALSHI, cfg)?;
        let base = if cfg.base_url.trim().is_empty() { TRADE_API_URL } else { cfg.base_url.as_str() };

        let signer = match (&cfg.auth_key, &cfg.auth_private_key) {
            (Some(key_id), Some(pem)) => Some(KalshiSigner::from_pem(key_id, pem)?),
            _ => {
                info!("Kalshi credentials incomplete, order entry disabled");
                None
            }
        };

        Ok(Self {
            api: VenueHttp::new(KALSHI, http, base, cfg.retry_count),
            configured_series: cfg.configured_series(),
            series_cache: SeriesCache::new(SERIES_CACHE_TTL),
            signer,
        })
    }

    /// Series tickers to list: the configured ones, else the cached or
    /// freshly fetched Sports series.
    pub async fn series_tickers(&self) -> Result<Vec<String>> {
        if !self.configured_series.is_empty() {
            return Ok(self.configured_series.clone());
        }
        if let Some(cached) = self.series_cache.get_at(Instant::now()) {
            debug!(count = cached.len(), "Kalshi series served from cache");
            return Ok(cached);
        }

        let resp: SeriesResponse = self
            .api
            .get_json("series", &[("category", SPORTS_CATEGORY.to_string())])
            .await
            .context("Kalshi series request failed")?;
        let tickers: Vec<String> = resp
            .series
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s.category.is_empty() || s.category.eq_ignore_ascii_case(SPORTS_CATEGORY))
            .map(|s| s.ticker)
            .filter(|t| !t.is_empty())
            .collect();

        self.series_cache.put_at(Instant::now(), tickers.clone());
        info!(count = tickers.len(), "Fetched Kalshi sports series");
        Ok(tickers)
    }

    /// Open events of one series with nested markets, following cursors.
    pub async fn fetch_series_events(&self, series_ticker: &str) -> Result<Vec<KalshiEvent>> {
        let mut events = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let mut query = vec![
                ("series_ticker", series_ticker.to_string()),
                ("with_nested_markets", "true".to_string()),
                ("status", "open".to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let page: EventsResponse = self.api.get_json("events", &query).await?;
            events.extend(page.events);
            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }
        Ok(events)
    }

    pub async fn fetch_market(&self, ticker: &str) -> Result<KalshiMarket> {
        let path = format!("markets/{}", urlencoding::encode(ticker));
        let resp: MarketResponse = self
            .api
            .get_json(&path, &[])
            .await
            .with_context(|| format!("Kalshi market {ticker} request failed"))?;
        Ok(resp.market)
    }

    /// One raw event per market; the market ticker is the event id.
    pub fn to_raw(event: &KalshiEvent, event_type: &str) -> Vec<RawEvent> {
        event
            .markets
            .iter()
            .filter(|m| !m.ticker.is_empty())
            .map(|m| RawEvent {
                platform_event_id: m.ticker.clone(),
                title: if event.title.is_empty() { m.title.clone() } else { event.title.clone() },
                event_type: event_type.to_string(),
                start_time: event
                    .strike_date
                    .clone()
                    .or_else(|| m.expected_expiration_time.clone())
                    .or_else(|| m.open_time.clone()),
                end_time: m.close_time.clone(),
                status: m.normalised_status().to_string(),
                markets: vec![m.to_raw_market()],
                result: None,
                result_source: None,
            })
            .collect()
    }

    pub fn market_odds(market: &KalshiMarket) -> Vec<NewOdds> {
        let (yes, no) = market.yes_no_prices();
        vec![
            NewOdds::new(PLATFORM_KALSHI, &market.ticker, "YES", OptionType::Win, yes),
            NewOdds::new(PLATFORM_KALSHI, &market.ticker, "NO", OptionType::Lose, no),
        ]
    }

    /// Result of a determined market, `None` while it is still trading.
    pub fn derive_result(market: &KalshiMarket) -> Option<EventResult> {
        let status = market.status.to_lowercase();
        if !matches!(status.as_str(), "settled" | "finalized" | "determined") {
            return None;
        }
        let result_source = format!("{KALSHI}:{}", market.ticker);
        match market.result.as_deref().map(str::to_lowercase).as_deref() {
            Some("yes") => Some(EventResult {
                status: EventStatus::Resolved,
                result: Some("YES".to_string()),
                result_source,
            }),
            Some("no") => Some(EventResult {
                status: EventStatus::Resolved,
                result: Some("NO".to_string()),
                result_source,
            }),
            Some("void") | Some("canceled") | Some("cancelled") => Some(EventResult {
                status: EventStatus::Canceled,
                result: None,
                result_source,
            }),
            _ => None,
        }
    }

    /// JSON body of a limit buy.
    pub fn order_body(req: &PlaceOrderRequest) -> Result<serde_json::Value> {
        let side = match req.bet_option.trim().to_lowercase().as_str() {
            "yes" => "yes",
            "no" => "no",
            other => bail!("Kalshi only accepts YES or NO, got '{other}'"),
        };
        let count = (req.amount.floor() as i64).max(1);
        let cents = ((req.locked_odds * 100.0).round() as i64).clamp(1, 99);

        let mut body = serde_json::json!({
            "ticker": req.platform_event_id,
            "client_order_id": req.client_order_id,
            "side": side,
            "action": "buy",
            "count": count,
            "type": "limit",
        });
        body[format!("{side}_price")] = serde_json::json!(cents);
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// VenueAdapter trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl VenueAdapter for KalshiClient {
    fn name(&self) -> &str {
        KALSHI
    }

    fn platform_id(&self) -> i64 {
        PLATFORM_KALSHI
    }

    async fn fetch_events_stream(
        &self,
        event_type: &str,
        sink: &mut dyn BatchSink,
    ) -> Result<StreamStats> {
        let tickers = self.series_tickers().await?;
        let mut seen = SeenEvents::new();
        let mut stats = StreamStats::default();

        for ticker in &tickers {
            match self.fetch_series_events(ticker).await {
                Ok(events) => {
                    let raws = events.iter().flat_map(|e| Self::to_raw(e, event_type)).collect();
                    deliver_chunk(&mut seen, sink, &mut stats, raws).await?;
                }
                Err(e) => {
                    warn!(series = %ticker, error = %e, "Skipping Kalshi series");
                    stats.chunks += 1;
                    stats.skipped_chunks += 1;
                }
            }
        }

        info!(
            series = tickers.len(),
            batches = stats.batches,
            events = stats.events,
            skipped = stats.skipped_chunks,
            "Kalshi stream complete"
        );
        Ok(stats)
    }

    async fn fetch_live_odds(&self, platform_event_id: &str) -> Result<Vec<NewOdds>> {
        let market = self.fetch_market(platform_event_id).await?;
        Ok(Self::market_odds(&market))
    }

    async fn fetch_event_result(&self, platform_event_id: &str) -> Result<Option<EventResult>> {
        let market = self.fetch_market(platform_event_id).await?;
        Ok(Self::derive_result(&market))
    }

    fn trading(&self) -> Option<&dyn TradingVenue> {
        Some(self)
    }
}

#[async_trait]
impl TradingVenue for KalshiClient {
    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<PlaceOrderReceipt> {
        let Some(signer) = &self.signer else {
            bail!("Kalshi trading credentials are not configured");
        };
        let body = Self::order_body(req)?.to_string();
        let url = self.api.url("portfolio/orders");
        let path = reqwest::Url::parse(&url)
            .with_context(|| format!("Invalid Kalshi URL {url}"))?
            .path()
            .to_string();

        // Each attempt is signed afresh so the timestamp stays current.
        let resp = self
            .api
            .send_with_retry(|| {
                let mut builder = self
                    .api
                    .client()
                    .post(&url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone());
                for (name, value) in signer.headers("POST", &path) {
                    builder = builder.header(name, value);
                }
                builder
            })
            .await?;

        let created: CreateOrderResponse = resp
            .json()
            .await
            .context("Malformed Kalshi order response")?;
        if created.order.order_id.is_empty() {
            bail!("Kalshi order response carried no order id");
        }

        info!(
            ticker = %req.platform_event_id,
            side = %req.bet_option,
            order_id = %created.order.order_id,
            "Kalshi order placed"
        );
        Ok(PlaceOrderReceipt {
            platform_order_id: created.order.order_id,
            status: created.order.status,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
