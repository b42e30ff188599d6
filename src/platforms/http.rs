//! Shared HTTP plumbing for venue clients.
//!
//! One `reqwest::Client` per adapter (gzip, optional proxy, per-venue
//! timeout) plus a retry loop for transport errors and 5xx responses.

use anyhow::{bail, Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PlatformConfig;

const RETRY_BACKOFF_MS: u64 = 500;
const MAX_ERROR_BODY: usize = 512;

/// Build the HTTP client for one venue.
pub fn build_client(venue: &str, cfg: &PlatformConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(cfg.timeout())
        .gzip(true)
        .user_agent(concat!("venue-router/", env!("CARGO_PKG_VERSION")));

    if let Some(proxy) = cfg.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
        let proxy = reqwest::Proxy::all(proxy)
            .with_context(|| format!("Invalid proxy for {venue}: {proxy}"))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .with_context(|| format!("Failed to build {venue} HTTP client"))
}

/// A venue base URL with its client and retry policy.
#[derive(Clone)]
pub struct VenueHttp {
    venue: &'static str,
    client: Client,
    base_url: String,
    retry_count: u32,
}

impl VenueHttp {
    pub fn new(venue: &'static str, client: Client, base_url: &str, retry_count: u32) -> Self {
        Self {
            venue,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_count,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path` with `query` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .send_with_retry(|| self.client.get(&url).query(query))
            .await?;
        resp.json::<T>()
            .await
            .with_context(|| format!("{} returned malformed JSON for {path}", self.venue))
    }

    /// Send the request built by `build`, retrying transport errors and
    /// 5xx responses with linear backoff. Non-2xx answers become errors
    /// carrying the status and (truncated) body.
    pub async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = build().send().await;
            let retryable = match &outcome {
                Ok(resp) => resp.status().is_server_error(),
                Err(e) => !e.is_builder(),
            };

            if retryable && attempt < self.retry_count {
                attempt += 1;
                let delay = Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64);
                match &outcome {
                    Ok(resp) => warn!(venue = self.venue, status = %resp.status(), attempt, "Retrying venue request"),
                    Err(e) => warn!(venue = self.venue, error = %e, attempt, "Retrying venue request"),
                }
                tokio::time::sleep(delay).await;
                continue;
            }

            let resp = outcome.with_context(|| format!("{} request failed", self.venue))?;
            return check_status(self.venue, resp).await;
        }
    }
}

async fn check_status(venue: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        debug!(venue, %status, url = %resp.url(), "Venue response");
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    bail!("{venue} API error {status}: {}", clip(&body))
}

fn clip(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Whether an error chain came from a 404 answer.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.to_string().contains(StatusCode::NOT_FOUND.as_str())
}

/// Accept a JSON number or numeric string as `f64`.
pub fn de_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let v = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match v {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

/// Accept a JSON number or string as `String`.
pub fn de_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let v = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match v {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
