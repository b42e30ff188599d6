//! Polymarket integration.
//!
//! Uses the Gamma API for discovery, live prices and results (no auth
//! required) and the CLOB API for order placement (EIP-712 signed order
//! plus HMAC L2 headers).
//!
//! Gamma API: https://gamma-api.polymarket.com
//! CLOB API: https://clob.polymarket.com

use alloy::primitives::{address, Address, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::{eip712_domain, Eip712Domain, SolStruct};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config::PlatformConfig;
use crate::platforms::convert::{self, parse_string_array};
use crate::platforms::http::{build_client, de_opt_f64, de_string_or_number, VenueHttp};
use crate::platforms::{
    deliver_chunk, BatchSink, PlaceOrderReceipt, PlaceOrderRequest, SeenEvents, StreamStats,
    TradingVenue, VenueAdapter,
};
use crate::types::{EventResult, EventStatus, NewOdds, RawEvent, RawMarket, PLATFORM_POLYMARKET, POLYMARKET};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
const CLOB_API_URL: &str = "https://clob.polymarket.com";
const PAGE_LIMIT: usize = 100;
const MAX_PAGES: usize = 50;
/// Tag id attached to every sports item; filtering on it adds nothing.
const GENERIC_SPORTS_TAG: &str = "1";
const DEFAULT_TICK_SIZE: f64 = 0.01;
/// A closed market's outcome priced at or above this is the winner.
const WINNING_PRICE: f64 = 0.99;

const POLYGON_CHAIN_ID: u64 = 137;
const CTF_EXCHANGE: Address = address!("4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E");

type HmacSha256 = Hmac<Sha256>;

mod clob {
    alloy::sol! {
        #[derive(Debug)]
        struct Order {
            uint256 salt;
            address maker;
            address signer;
            address taker;
            uint256 tokenId;
            uint256 makerAmount;
            uint256 takerAmount;
            uint256 expiration;
            uint256 nonce;
            uint256 feeRateBps;
            uint8 side;
            uint8 signatureType;
        }
    }
}

// ---------------------------------------------------------------------------
// Gamma API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct GammaSport {
    #[serde(default)]
    pub sport: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub series: String,
    /// Comma-separated tag ids.
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub tags: String,
}

impl GammaSport {
    fn tag_ids(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && t != GENERIC_SPORTS_TAG)
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GammaEvent {
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "startTime")]
    pub start_time: Option<String>,
    #[serde(default, rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(default, rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GammaMarket {
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub question: String,
    /// Sent as a JSON-encoded string: "[\"Yes\",\"No\"]".
    #[serde(default, deserialize_with = "de_string_list")]
    pub outcomes: Vec<String>,
    #[serde(default, rename = "outcomePrices", deserialize_with = "de_string_list")]
    pub outcome_prices: Vec<String>,
    #[serde(default, rename = "clobTokenIds", deserialize_with = "de_string_list")]
    pub clob_token_ids: Vec<String>,
    #[serde(default, rename = "orderPriceMinTickSize", deserialize_with = "de_opt_f64")]
    pub tick_size: Option<f64>,
    #[serde(default)]
    pub closed: bool,
}

impl GammaMarket {
    fn prices(&self) -> Vec<f64> {
        let parsed: Option<Vec<f64>> = self
            .outcome_prices
            .iter()
            .map(|p| p.trim().parse::<f64>().ok())
            .collect();
        parsed.unwrap_or_default()
    }
}

/// Accept either a JSON-encoded string array or a plain array.
fn de_string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match v {
        Some(serde_json::Value::String(s)) => parse_string_array(&s),
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .map(|i| match i {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    })
}

#[derive(Debug, Deserialize)]
struct ClobOrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "errorMsg")]
    error_msg: String,
    #[serde(default, rename = "orderID")]
    order_id: String,
    #[serde(default)]
    status: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// L2 API credential triple issued by the CLOB.
struct ClobCredentials {
    api_key: String,
    secret: SecretString,
    passphrase: SecretString,
}

impl std::fmt::Debug for ClobCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobCredentials")
            .field("api_key", &"[REDACTED]")
            .field("secret", &"[REDACTED]")
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

impl ClobCredentials {
    /// URL-safe base64 HMAC-SHA256 over `timestamp + method + path + body`.
    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let secret = URL_SAFE
            .decode(self.secret.expose_secret().trim())
            .context("Polymarket API secret is not valid base64")?;
        let mut mac = HmacSha256::new_from_slice(&secret)
            .map_err(|e| anyhow::anyhow!("HMAC key rejected: {e}"))?;
        mac.update(format!("{timestamp}{}{path}{body}", method.to_uppercase()).as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }
}

pub struct PolymarketClient {
    gamma: VenueHttp,
    clob: VenueHttp,
    sport_filter: Option<String>,
    credentials: Option<ClobCredentials>,
    signer: Option<PrivateKeySigner>,
}

impl PolymarketClient {
    pub fn new(cfg: &PlatformConfig) -> Result<Self> {
        let http = build_client(POLYMARKET, cfg)?;
        let gamma_url = if cfg.base_url.trim().is_empty() { GAMMA_API_URL } else { cfg.base_url.as_str() };
        let clob_url = cfg
            .clob_base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(CLOB_API_URL);

        let credentials = match (&cfg.auth_key, &cfg.auth_secret, &cfg.auth_token) {
            (Some(key), Some(secret), Some(passphrase)) => Some(ClobCredentials {
                api_key: key.clone(),
                secret: SecretString::new(secret.clone()),
                passphrase: SecretString::new(passphrase.clone()),
            }),
            _ => None,
        };
        let signer = cfg
            .auth_private_key
            .as_deref()
            .map(|k| k.trim().parse::<PrivateKeySigner>())
            .transpose()
            .context("Invalid Polymarket private key")?;

        if credentials.is_none() || signer.is_none() {
            info!("Polymarket credentials incomplete, order entry disabled");
        }

        Ok(Self {
            gamma: VenueHttp::new(POLYMARKET, http.clone(), gamma_url, cfg.retry_count),
            clob: VenueHttp::new(POLYMARKET, http, clob_url, cfg.retry_count),
            sport_filter: cfg.sport_path.clone().filter(|s| !s.trim().is_empty()),
            credentials,
            signer,
        })
    }

    /// Sports catalog: one item per league with its series and tags.
    pub async fn fetch_sports(&self) -> Result<Vec<GammaSport>> {
        let sports: Vec<GammaSport> = self
            .gamma
            .get_json("sports", &[])
            .await
            .context("Gamma sports catalog request failed")?;
        let filtered: Vec<GammaSport> = sports
            .into_iter()
            .filter(|s| !s.series.is_empty())
            .filter(|s| match &self.sport_filter {
                Some(want) => s.sport.eq_ignore_ascii_case(want),
                None => true,
            })
            .collect();
        debug!(count = filtered.len(), "Fetched Gamma sports catalog");
        Ok(filtered)
    }

    /// All open events of one series, paging each tag until a short page.
    pub async fn fetch_series_events(&self, sport: &GammaSport) -> Result<Vec<GammaEvent>> {
        let tags = sport.tag_ids();
        let tag_filters: Vec<Option<&str>> = if tags.is_empty() {
            vec![None]
        } else {
            tags.iter().map(|t| Some(t.as_str())).collect()
        };

        let mut events = Vec::new();
        for tag in tag_filters {
            for page in 0..MAX_PAGES {
                let mut query = vec![
                    ("series_id", sport.series.clone()),
                    ("active", "true".to_string()),
                    ("closed", "false".to_string()),
                    ("limit", PAGE_LIMIT.to_string()),
                    ("offset", (page * PAGE_LIMIT).to_string()),
                ];
                if let Some(tag) = tag {
                    query.push(("tag_id", tag.to_string()));
                }
                let batch: Vec<GammaEvent> = self.gamma.get_json("events", &query).await?;
                let short = batch.len() < PAGE_LIMIT;
                events.extend(batch);
                if short {
                    break;
                }
            }
        }
        Ok(events)
    }

    pub async fn fetch_event(&self, event_id: &str) -> Result<GammaEvent> {
        let path = format!("events/{}", urlencoding::encode(event_id));
        self.gamma
            .get_json(&path, &[])
            .await
            .with_context(|| format!("Gamma event {event_id} request failed"))
    }

    /// Venue-neutral shape of a Gamma event.
    pub fn to_raw(event: &GammaEvent, event_type: &str) -> RawEvent {
        let status = if event.closed {
            "closed"
        } else if event.active {
            "open"
        } else {
            "canceled"
        };
        RawEvent {
            platform_event_id: event.id.clone(),
            title: event.title.clone(),
            event_type: event_type.to_string(),
            start_time: event.start_time.clone().or_else(|| event.start_date.clone()),
            end_time: event.end_date.clone(),
            status: status.to_string(),
            markets: event
                .markets
                .iter()
                .map(|m| RawMarket {
                    market_id: m.id.clone(),
                    outcomes: m.outcomes.clone(),
                    prices: m.prices(),
                })
                .collect(),
            result: None,
            result_source: None,
        }
    }

    /// Winner of a closed event: the first outcome priced at 0.99 or more.
    pub fn derive_result(event: &GammaEvent) -> Option<EventResult> {
        if !event.closed {
            return None;
        }
        let winner = event.markets.iter().find_map(|m| {
            m.outcomes
                .iter()
                .zip(m.prices())
                .find(|(_, price)| *price >= WINNING_PRICE)
                .map(|(name, _)| name.clone())
        })?;
        Some(EventResult {
            status: EventStatus::Resolved,
            result: Some(winner),
            result_source: format!("{POLYMARKET}:{}", event.id),
        })
    }

    /// CLOB token and tick size for `bet_option`.
    ///
    /// Two-outcome markets map YES/NO by index (0 = YES, 1 = NO) whatever
    /// their labels; otherwise the outcome label is matched.
    pub fn resolve_token(event: &GammaEvent, bet_option: &str) -> Result<(String, f64)> {
        let want = bet_option.trim();
        let yes_no_index = match want.to_uppercase().as_str() {
            "YES" => Some(0),
            "NO" => Some(1),
            _ => None,
        };

        for market in &event.markets {
            let tick = market.tick_size.filter(|t| *t > 0.0).unwrap_or(DEFAULT_TICK_SIZE);
            if market.clob_token_ids.len() != market.outcomes.len() {
                continue;
            }
            if let Some(idx) = yes_no_index {
                if market.outcomes.len() == 2 {
                    return Ok((market.clob_token_ids[idx].clone(), tick));
                }
            }
            if let Some(idx) = market.outcomes.iter().position(|o| o.trim().eq_ignore_ascii_case(want)) {
                return Ok((market.clob_token_ids[idx].clone(), tick));
            }
        }
        bail!("No Polymarket market in event {} offers option '{want}'", event.id)
    }

    fn exchange_domain() -> Eip712Domain {
        eip712_domain! {
            name: "Polymarket CTF Exchange",
            version: "1",
            chain_id: POLYGON_CHAIN_ID,
            verifying_contract: CTF_EXCHANGE,
        }
    }

    /// Build and sign a GTC BUY order. Returns the order and its hex signature.
    fn build_signed_order(
        signer: &PrivateKeySigner,
        token_id: &str,
        price: f64,
        tick_size: f64,
        amount: f64,
    ) -> Result<(clob::Order, String)> {
        if !(price > 0.0 && price < 1.0) {
            bail!("Polymarket price must be inside (0, 1), got {price}");
        }
        let tick = Decimal::from_f64(tick_size).unwrap_or(dec!(0.01)).normalize();
        let price = Decimal::from_f64(price)
            .context("Unrepresentable price")?
            .round_dp_with_strategy(tick.scale(), RoundingStrategy::MidpointNearestEven);
        let size = Decimal::from_f64(amount.max(1.0))
            .context("Unrepresentable size")?
            .round_dp_with_strategy(2, RoundingStrategy::ToZero);

        let maker_amount = to_base_units((price * size).round_dp_with_strategy(4, RoundingStrategy::ToZero))?;
        let taker_amount = to_base_units(size)?;
        let token_id = U256::from_str_radix(token_id.trim(), 10)
            .with_context(|| format!("Invalid CLOB token id {token_id}"))?;

        let order = clob::Order {
            salt: U256::from(rand::random::<u32>()),
            maker: signer.address(),
            signer: signer.address(),
            taker: Address::ZERO,
            tokenId: token_id,
            makerAmount: maker_amount,
            takerAmount: taker_amount,
            expiration: U256::ZERO,
            nonce: U256::ZERO,
            feeRateBps: U256::ZERO,
            side: 0,
            signatureType: 0,
        };
        let hash = order.eip712_signing_hash(&Self::exchange_domain());
        let signature = signer
            .sign_hash_sync(&hash)
            .context("Failed to sign CLOB order")?;
        Ok((order, format!("0x{}", hex::encode(signature.as_bytes()))))
    }

    fn order_body(order: &clob::Order, signature: &str, owner: &str) -> serde_json::Value {
        serde_json::json!({
            "order": {
                "salt": order.salt.to::<u64>(),
                "maker": order.maker.to_string(),
                "signer": order.signer.to_string(),
                "taker": order.taker.to_string(),
                "tokenId": order.tokenId.to_string(),
                "makerAmount": order.makerAmount.to_string(),
                "takerAmount": order.takerAmount.to_string(),
                "expiration": order.expiration.to_string(),
                "nonce": order.nonce.to_string(),
                "feeRateBps": order.feeRateBps.to_string(),
                "side": "BUY",
                "signatureType": order.signatureType,
                "signature": signature,
            },
            "owner": owner,
            "orderType": "GTC",
        })
    }
}

/// Scale a 6-decimal amount to integer units.
fn to_base_units(value: Decimal) -> Result<U256> {
    let units = (value * dec!(1_000_000)).trunc();
    let units = units.to_u128().context("Amount out of range")?;
    Ok(U256::from(units))
}

// ---------------------------------------------------------------------------
// VenueAdapter trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl VenueAdapter for PolymarketClient {
    fn name(&self) -> &str {
        POLYMARKET
    }

    fn platform_id(&self) -> i64 {
        PLATFORM_POLYMARKET
    }

    async fn fetch_events_stream(
        &self,
        event_type: &str,
        sink: &mut dyn BatchSink,
    ) -> Result<StreamStats> {
        let sports = self.fetch_sports().await?;
        let mut seen = SeenEvents::new();
        let mut stats = StreamStats::default();

        for sport in &sports {
            match self.fetch_series_events(sport).await {
                Ok(events) => {
                    let raws = events.iter().map(|e| Self::to_raw(e, event_type)).collect();
                    deliver_chunk(&mut seen, sink, &mut stats, raws).await?;
                }
                Err(e) => {
                    warn!(series = %sport.series, sport = %sport.sport, error = %e, "Skipping Polymarket series");
                    stats.chunks += 1;
                    stats.skipped_chunks += 1;
                }
            }
        }

        info!(
            series = sports.len(),
            batches = stats.batches,
            events = stats.events,
            skipped = stats.skipped_chunks,
            "Polymarket stream complete"
        );
        Ok(stats)
    }

    async fn fetch_live_odds(&self, platform_event_id: &str) -> Result<Vec<NewOdds>> {
        let event = self.fetch_event(platform_event_id).await?;
        let raw = Self::to_raw(&event, "");
        Ok(convert::to_event_record(PLATFORM_POLYMARKET, &raw).odds)
    }

    async fn fetch_event_result(&self, platform_event_id: &str) -> Result<Option<EventResult>> {
        let event = self.fetch_event(platform_event_id).await?;
        Ok(Self::derive_result(&event))
    }

    fn trading(&self) -> Option<&dyn TradingVenue> {
        Some(self)
    }
}

#[async_trait]
impl TradingVenue for PolymarketClient {
    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<PlaceOrderReceipt> {
        let (Some(creds), Some(signer)) = (&self.credentials, &self.signer) else {
            bail!("Polymarket trading credentials are not configured");
        };
        if !(req.locked_odds > 0.0 && req.locked_odds < 1.0) {
            bail!("locked odds {} outside (0, 1)", req.locked_odds);
        }

        let event = self.fetch_event(&req.platform_event_id).await?;
        let (token_id, tick) = Self::resolve_token(&event, &req.bet_option)?;
        let (order, signature) =
            Self::build_signed_order(signer, &token_id, req.locked_odds, tick, req.amount)?;
        let body = Self::order_body(&order, &signature, &creds.api_key).to_string();

        let path = "/order";
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let l2_signature = creds.sign(&timestamp, "POST", path, &body)?;
        let address = signer.address().to_string();
        let url = self.clob.url(path);

        let resp = self
            .clob
            .send_with_retry(|| {
                self.clob
                    .client()
                    .post(&url)
                    .header(CONTENT_TYPE, "application/json")
                    .header("POLY_ADDRESS", &address)
                    .header("POLY_SIGNATURE", &l2_signature)
                    .header("POLY_TIMESTAMP", &timestamp)
                    .header("POLY_API_KEY", &creds.api_key)
                    .header("POLY_PASSPHRASE", creds.passphrase.expose_secret())
                    .body(body.clone())
            })
            .await?;
        let parsed: ClobOrderResponse = resp
            .json()
            .await
            .context("Malformed CLOB order response")?;

        if !parsed.success || parsed.order_id.is_empty() {
            bail!("Polymarket rejected order: {}", parsed.error_msg);
        }

        info!(
            event = %req.platform_event_id,
            token = %token_id,
            price = req.locked_odds,
            order_id = %parsed.order_id,
            "Polymarket order placed"
        );
        Ok(PlaceOrderReceipt {
            platform_order_id: parsed.order_id,
            status: parsed.status,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
