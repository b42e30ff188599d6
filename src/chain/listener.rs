//! Escrow log subscription.
//!
//! Subscribes over WebSocket to `FundsLocked` and `Settled` logs from the
//! escrow and settlement contracts and hands each decoded log to a
//! [`ChainEventSink`]. A failing log is logged and skipped; losing the
//! subscription ends the task with an error for its supervisor.

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{decode_log, funds_locked_topic, parse_address, settled_topic, ChainEvent};
use crate::config::ChainConfig;
use crate::types::{AppError, NewDeposit, SettlementNotice};

/// Consumer of decoded escrow logs.
#[async_trait]
pub trait ChainEventSink: Send + Sync {
    async fn on_deposit(&self, deposit: NewDeposit) -> Result<(), AppError>;

    async fn on_settlement(&self, notice: SettlementNotice, block_number: i64) -> Result<(), AppError>;
}

pub struct ChainListener {
    ws_url: String,
    addresses: Vec<Address>,
    sink: Arc<dyn ChainEventSink>,
}

impl ChainListener {
    /// `None` when no WebSocket URL or watched address is configured.
    pub fn from_config(cfg: &ChainConfig, sink: Arc<dyn ChainEventSink>) -> Result<Option<Self>> {
        let Some(ws_url) = cfg.ws_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let addresses = cfg
            .watched_addresses()
            .iter()
            .map(|a| parse_address(a))
            .collect::<Result<Vec<_>, _>>()
            .context("invalid watched contract address")?;
        if addresses.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            ws_url: ws_url.to_string(),
            addresses,
            sink,
        }))
    }

    pub fn filter(&self) -> Filter {
        Filter::new()
            .address(self.addresses.clone())
            .event_signature(vec![funds_locked_topic(), settled_topic()])
    }

    /// Stream logs until cancelled. Returns an error when the
    /// subscription cannot be opened or ends on its own.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(self.ws_url.clone()))
            .await
            .with_context(|| format!("failed to connect to {}", self.ws_url))?;
        let subscription = provider
            .subscribe_logs(&self.filter())
            .await
            .context("failed to subscribe to escrow logs")?;
        let mut stream = subscription.into_stream();
        info!(contracts = self.addresses.len(), "Chain listener subscribed");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Chain listener stopping");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(log) => self.handle_log(&log).await,
                    None => bail!("escrow log subscription closed"),
                },
            }
        }
    }

    /// Decode and dispatch one log, logging any failure.
    pub async fn handle_log(&self, log: &Log) {
        let decoded = decode_log(
            log.topics(),
            &log.data().data,
            log.transaction_hash,
            log.block_number,
        );
        match decoded {
            Ok(Some(event)) => {
                if let Err(e) = dispatch(self.sink.as_ref(), event).await {
                    warn!(tx_hash = ?log.transaction_hash, error = %e, "Escrow log handling failed");
                }
            }
            Ok(None) => debug!(tx_hash = ?log.transaction_hash, "Ignoring unrelated log"),
            Err(e) => warn!(tx_hash = ?log.transaction_hash, error = %e, "Undecodable escrow log"),
        }
    }
}

/// Route a decoded log to the sink.
pub async fn dispatch(sink: &dyn ChainEventSink, event: ChainEvent) -> Result<(), AppError> {
    match event {
        ChainEvent::Deposit(deposit) => sink.on_deposit(deposit).await,
        ChainEvent::Settlement {
            notice,
            block_number,
        } => sink.on_settlement(notice, block_number).await,
    }
}
