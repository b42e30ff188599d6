//! Escrow refunds through the executor key.

use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parse_address;
use crate::config::ChainConfig;
use crate::types::AppError;

mod abi {
    alloy::sol! {
        function releaseFunds(bytes32 betId, address to, uint256 amount) external;
    }
}

pub const RECEIPT_POLL_ATTEMPTS: u32 = 30;
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Releases escrowed funds back to a depositor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FundsReleaser: Send + Sync {
    /// Submit `releaseFunds` and wait for a successful receipt.
    /// Returns the transaction hash.
    async fn release_funds(
        &self,
        bet_id: B256,
        to: Address,
        amount: U256,
        cancel: CancellationToken,
    ) -> Result<String, AppError>;
}

/// `releaseFunds` calldata.
pub fn release_calldata(bet_id: B256, to: Address, amount: U256) -> Vec<u8> {
    abi::releaseFundsCall {
        betId: bet_id,
        to,
        amount,
    }
    .abi_encode()
}

/// Executor-signed escrow client over JSON-RPC.
pub struct EscrowExecutor {
    rpc_url: String,
    escrow: Address,
    key: SecretString,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl EscrowExecutor {
    /// `None` when the chain section lacks an RPC URL, escrow address or
    /// executor key.
    pub fn from_config(cfg: &ChainConfig) -> Result<Option<Self>, AppError> {
        let (Some(rpc_url), Some(escrow), Some(key)) = (
            cfg.rpc_url.as_deref().filter(|s| !s.trim().is_empty()),
            cfg.escrow_address.as_deref().filter(|s| !s.trim().is_empty()),
            cfg.executor_private_key.as_deref().filter(|s| !s.trim().is_empty()),
        ) else {
            return Ok(None);
        };
        // Validate the key up front so a bad secret fails at startup.
        key.trim()
            .parse::<PrivateKeySigner>()
            .map_err(|e| AppError::Internal(format!("invalid executor key: {e}")))?;
        Ok(Some(Self {
            rpc_url: rpc_url.to_string(),
            escrow: parse_address(escrow)?,
            key: SecretString::new(key.trim().to_string()),
            poll_attempts: RECEIPT_POLL_ATTEMPTS,
            poll_interval: RECEIPT_POLL_INTERVAL,
        }))
    }

    fn signer(&self) -> Result<PrivateKeySigner, AppError> {
        self.key
            .expose_secret()
            .parse::<PrivateKeySigner>()
            .map_err(|e| AppError::Internal(format!("invalid executor key: {e}")))
    }
}

#[async_trait]
impl FundsReleaser for EscrowExecutor {
    async fn release_funds(
        &self,
        bet_id: B256,
        to: Address,
        amount: U256,
        cancel: CancellationToken,
    ) -> Result<String, AppError> {
        let signer = self.signer()?;
        let executor = signer.address();
        let url: reqwest::Url = self
            .rpc_url
            .parse()
            .map_err(|e| AppError::Internal(format!("invalid rpc_url: {e}")))?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url);

        let tx = TransactionRequest::default()
            .with_to(self.escrow)
            .with_input(release_calldata(bet_id, to, amount));
        let pending = provider
            .send_transaction(tx)
            .await
            .map_err(|e| AppError::UpstreamChain(format!("releaseFunds submission failed: {e}")))?;
        let tx_hash = *pending.tx_hash();
        info!(tx_hash = %tx_hash, bet_id = %bet_id, %to, %amount, %executor, "releaseFunds submitted");

        for attempt in 1..=self.poll_attempts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::UpstreamChain(format!(
                        "cancelled while waiting for receipt of {tx_hash:#x}; the transaction may still land"
                    )));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            match provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.status() => {
                    info!(tx_hash = %tx_hash, block = ?receipt.block_number, "releaseFunds confirmed");
                    return Ok(format!("{tx_hash:#x}"));
                }
                Ok(Some(_)) => {
                    return Err(AppError::UpstreamChain(format!(
                        "releaseFunds reverted in {tx_hash:#x}: check the betId is the full 32-byte id, \
                         that {executor} holds the executor role, and that the funds were not already released"
                    )));
                }
                Ok(None) => debug!(tx_hash = %tx_hash, attempt, "Receipt not yet available"),
                Err(e) => warn!(tx_hash = %tx_hash, attempt, error = %e, "Receipt lookup failed"),
            }
        }
        Err(AppError::UpstreamChain(format!(
            "no receipt for {tx_hash:#x} after {} attempts",
            self.poll_attempts
        )))
    }
}
