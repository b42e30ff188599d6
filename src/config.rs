//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults so a minimal file is enough for local runs.
//! Credentials may live in the file, but the environment always wins, and
//! the chain executor key is only ever read from the environment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::time::Duration;

use crate::types::{KALSHI, POLYMARKET};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Per-venue settings keyed by platform name.
    #[serde(default)]
    pub platforms: HashMap<String, PlatformConfig>,
    #[serde(default)]
    pub circle: CircleConfig,
    #[serde(default)]
    pub chain: ChainConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// "debug" or "release"; debug widens the default log filter.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_cors")]
    pub cors_allow_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            mode: default_mode(),
            cors_allow_origins: default_cors(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_dsn")]
    pub dsn: String,
    #[serde(default = "default_max_open")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle")]
    pub max_idle_conns: u32,
    #[serde(default = "default_conn_lifetime")]
    pub conn_max_lifetime_sec: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: default_dsn(),
            max_open_conns: default_max_open(),
            max_idle_conns: default_max_idle(),
            conn_max_lifetime_sec: default_conn_lifetime(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default = "default_log_size")]
    pub max_size_mb: u64,
    #[serde(default = "default_log_age")]
    pub max_age_days: u64,
    #[serde(default = "default_true")]
    pub stdout: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file_path: None,
            max_size_mb: default_log_size(),
            max_age_days: default_log_age(),
            stdout: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// `@every <N>{s,m,h}` descriptor; overrides `interval_sec` when set.
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_ingest_interval")]
    pub interval_sec: u64,
    #[serde(default)]
    pub enabled_platforms: Vec<String>,
    #[serde(default)]
    pub odds_sync_enabled: bool,
    #[serde(default = "default_odds_interval")]
    pub odds_sync_interval_sec: u64,
    #[serde(default = "default_result_interval")]
    pub result_sync_interval_sec: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cron: None,
            interval_sec: default_ingest_interval(),
            enabled_platforms: Vec::new(),
            odds_sync_enabled: false,
            odds_sync_interval_sec: default_odds_interval(),
            result_sync_interval_sec: default_result_interval(),
        }
    }
}

impl SyncConfig {
    /// Period of the scheduled ingest run.
    pub fn ingest_interval(&self) -> Result<Duration> {
        match self.cron.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(expr) => parse_every(expr),
            None => Ok(Duration::from_secs(self.interval_sec.max(1))),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PlatformConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_sec: u64,
    #[serde(default = "default_retry")]
    pub retry_count: u32,
    #[serde(default)]
    pub sport_path: Option<String>,
    #[serde(default)]
    pub series_ticker: Option<String>,
    #[serde(default)]
    pub series_tickers: Vec<String>,
    #[serde(default)]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub auth_secret: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub auth_private_key: Option<String>,
    #[serde(default)]
    pub clob_base_url: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub min_bet: f64,
    /// Zero disables the upper bound.
    #[serde(default)]
    pub max_bet: f64,
}

impl PlatformConfig {
    /// Explicit series tickers, merging the single and list forms.
    pub fn configured_series(&self) -> Vec<String> {
        let mut out: Vec<String> = self.series_ticker.iter().cloned().collect();
        for t in &self.series_tickers {
            if !out.contains(t) {
                out.push(t.clone());
            }
        }
        out.retain(|t| !t.trim().is_empty());
        out
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircleConfig {
    #[serde(default = "default_circle_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for CircleConfig {
    fn default() -> Self {
        Self {
            base_url: default_circle_url(),
            api_key: None,
            timeout: default_timeout(),
            proxy: None,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub escrow_address: Option<String>,
    #[serde(default)]
    pub bet_router_address: Option<String>,
    #[serde(default)]
    pub settlement_address: Option<String>,
    #[serde(default)]
    pub fee_vault_address: Option<String>,
    /// Populated from `CHAIN_EXECUTOR_PRIVATE_KEY` only.
    #[serde(skip)]
    pub executor_private_key: Option<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            rpc_url: None,
            ws_url: None,
            escrow_address: None,
            bet_router_address: None,
            settlement_address: None,
            fee_vault_address: None,
            executor_private_key: None,
        }
    }
}

impl std::fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainConfig")
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("ws_url", &self.ws_url)
            .field("escrow_address", &self.escrow_address)
            .field("bet_router_address", &self.bet_router_address)
            .field("settlement_address", &self.settlement_address)
            .field("fee_vault_address", &self.fee_vault_address)
            .field(
                "executor_private_key",
                &self.executor_private_key.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl ChainConfig {
    /// Addresses the listener subscribes to: escrow and settlement contracts.
    pub fn watched_addresses(&self) -> Vec<String> {
        [&self.escrow_address, &self.settlement_address]
            .into_iter()
            .flatten()
            .filter(|a| !a.trim().is_empty())
            .cloned()
            .collect()
    }
}

fn default_port() -> u16 { 8080 }
fn default_mode() -> String { "release".to_string() }
fn default_cors() -> Vec<String> { vec!["*".to_string()] }
fn default_dsn() -> String { "sqlite://venue_router.db?mode=rwc".to_string() }
fn default_max_open() -> u32 { 10 }
fn default_max_idle() -> u32 { 2 }
fn default_conn_lifetime() -> u64 { 1800 }
fn default_log_size() -> u64 { 10 }
fn default_log_age() -> u64 { 2 }
fn default_true() -> bool { true }
fn default_ingest_interval() -> u64 { 900 }
fn default_odds_interval() -> u64 { 60 }
fn default_result_interval() -> u64 { 300 }
fn default_timeout() -> u64 { 30 }
fn default_retry() -> u32 { 2 }
fn default_circle_url() -> String { "https://api.circle.com".to_string() }
fn default_chain_id() -> u64 { 137 }

impl AppConfig {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let mut config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse configuration text without touching the environment.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    ///
    /// Venue keys are `{VENUE}_AUTH_KEY`, `_AUTH_SECRET`, `_AUTH_TOKEN`,
    /// `_PRIVATE_KEY` and `_PROXY`, with VENUE the upper-cased platform name.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut names: BTreeSet<String> = self.platforms.keys().cloned().collect();
        names.insert(POLYMARKET.to_string());
        names.insert(KALSHI.to_string());

        for name in names {
            let prefix = name.to_uppercase();
            let overrides = [
                ("AUTH_KEY", lookup(&format!("{prefix}_AUTH_KEY"))),
                ("AUTH_SECRET", lookup(&format!("{prefix}_AUTH_SECRET"))),
                ("AUTH_TOKEN", lookup(&format!("{prefix}_AUTH_TOKEN"))),
                ("PRIVATE_KEY", lookup(&format!("{prefix}_PRIVATE_KEY"))),
                ("PROXY", lookup(&format!("{prefix}_PROXY"))),
            ];
            if overrides.iter().all(|(_, v)| v.is_none()) {
                continue;
            }
            let entry = self.platforms.entry(name).or_default();
            for (field, value) in overrides {
                let Some(value) = value else { continue };
                match field {
                    "AUTH_KEY" => entry.auth_key = Some(value),
                    "AUTH_SECRET" => entry.auth_secret = Some(value),
                    "AUTH_TOKEN" => entry.auth_token = Some(value),
                    "PRIVATE_KEY" => entry.auth_private_key = Some(value),
                    _ => entry.proxy = Some(value),
                }
            }
        }

        if let Some(dsn) = lookup("DATABASE_DSN") {
            self.database.dsn = dsn;
        }
        if let Some(key) = lookup("CIRCLE_API_KEY") {
            self.circle.api_key = Some(key);
        }
        if let Some(url) = lookup("CIRCLE_BASE_URL") {
            self.circle.base_url = url;
        }
        self.chain.executor_private_key = lookup("CHAIN_EXECUTOR_PRIVATE_KEY");
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformConfig> {
        self.platforms.get(name)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

/// Parse an `@every 30s|15m|2h` schedule descriptor.
pub fn parse_every(expr: &str) -> Result<Duration> {
    let Some(every) = expr.trim().strip_prefix("@every") else {
        bail!("Unsupported schedule '{expr}', expected '@every <N>s|m|h'");
    };
    let every = every.trim();
    if every.len() < 2 {
        bail!("Missing interval in schedule '{expr}'");
    }
    let (num, unit) = every.split_at(every.len() - 1);
    let n: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("Invalid interval in schedule '{expr}'"))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => bail!("Unknown unit '{unit}' in schedule '{expr}'"),
    };
    if secs == 0 {
        bail!("Schedule interval must be positive: '{expr}'");
    }
    Ok(Duration::from_secs(secs))
}
