//! Fiat conversion for venues that settle in US dollars.
//!
//! Deposits arrive as dollar stablecoins, which convert 1:1. Any other
//! currency is rejected rather than guessed at. `CircleClient` is only a
//! reachability check for the payout service; it does not convert.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::CircleConfig;
use crate::types::AppError;

/// Currencies treated as one US dollar per unit.
pub const DOLLAR_STABLECOINS: &[&str] = &["USDC", "USDT", "USD"];

#[async_trait]
pub trait FiatConverter: Send + Sync {
    async fn to_usd(&self, amount: f64, currency: &str) -> Result<f64, AppError>;
}

/// Dollar value of `amount` in a stablecoin, or invalid-input.
pub fn stablecoin_to_usd(amount: f64, currency: &str) -> Result<f64, AppError> {
    let code = currency.trim().to_uppercase();
    if DOLLAR_STABLECOINS.contains(&code.as_str()) {
        Ok(amount)
    } else {
        Err(AppError::InvalidInput(format!("unsupported currency: {currency}")))
    }
}

/// Converter with no remote dependency.
#[derive(Debug, Clone, Copy, Default)]
pub struct StablecoinParity;

#[async_trait]
impl FiatConverter for StablecoinParity {
    async fn to_usd(&self, amount: f64, currency: &str) -> Result<f64, AppError> {
        stablecoin_to_usd(amount, currency)
    }
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    message: String,
}

/// Circle API client used to check the fiat payout service at startup.
pub struct CircleClient {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl CircleClient {
    pub fn new(cfg: &CircleConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout.max(1)))
            .gzip(true);
        if let Some(proxy) = cfg.proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("invalid circle proxy")?);
        }
        Ok(Self {
            http: builder.build().context("Failed to build Circle HTTP client")?,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg
                .api_key
                .clone()
                .filter(|k| !k.is_empty())
                .map(SecretString::new),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    /// `GET /ping`; succeeds when the API answers `pong`.
    pub async fn ping(&self) -> Result<()> {
        let mut req = self.http.get(format!("{}/ping", self.base_url));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }
        let resp = req.send().await.context("Circle ping failed")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("Circle ping returned HTTP {status}");
        }
        let body: PingResponse = resp.json().await.context("Failed to parse Circle ping")?;
        if body.message != "pong" {
            bail!("unexpected Circle ping reply: {}", body.message);
        }
        debug!(base_url = %self.base_url, "Circle reachable");
        Ok(())
    }
}
