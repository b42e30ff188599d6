//! On-chain escrow integration.
//!
//! - `listener`: WebSocket log subscription feeding deposits and settlements
//! - `escrow`: executor-signed `releaseFunds` calls for refunds
//! - `signature`: EIP-191 recovery of a user's signed order intent
//!
//! Escrow amounts are 6-decimal USDC integers on chain and `f64` dollars
//! everywhere else; conversion happens only in this module.

pub mod escrow;
pub mod listener;
pub mod signature;

use alloy::primitives::{keccak256, Address, B256, U256};
use rust_decimal::prelude::*;
use std::str::FromStr;

use crate::types::{AppError, NewDeposit, SettlementNotice, USDC_DECIMALS};

pub const FUNDS_LOCKED_EVENT: &str = "FundsLocked(bytes32,address,uint256)";
pub const SETTLED_EVENT: &str = "Settled(bytes32,uint256,uint256)";

pub const DEPOSIT_CURRENCY: &str = "USDC";

pub fn funds_locked_topic() -> B256 {
    keccak256(FUNDS_LOCKED_EVENT.as_bytes())
}

pub fn settled_topic() -> B256 {
    keccak256(SETTLED_EVENT.as_bytes())
}

/// A decoded escrow log.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    Deposit(NewDeposit),
    Settlement {
        notice: SettlementNotice,
        block_number: i64,
    },
}

/// Decode one log. Logs with an unrelated first topic yield `None`.
pub fn decode_log(
    topics: &[B256],
    data: &[u8],
    tx_hash: Option<B256>,
    block_number: Option<u64>,
) -> Result<Option<ChainEvent>, AppError> {
    let Some(topic0) = topics.first() else {
        return Ok(None);
    };
    let is_deposit = *topic0 == funds_locked_topic();
    if !is_deposit && *topic0 != settled_topic() {
        return Ok(None);
    }

    let bet_id = topics
        .get(1)
        .ok_or_else(|| AppError::UpstreamChain("escrow log without betId topic".into()))?;
    if data.len() < 64 {
        return Err(AppError::UpstreamChain(format!(
            "escrow log data too short: {} bytes",
            data.len()
        )));
    }
    let tx_hash = tx_hash
        .map(|h| format!("{h:#x}"))
        .ok_or_else(|| AppError::UpstreamChain("escrow log without transaction hash".into()))?;
    let block_number = block_number.unwrap_or_default() as i64;
    let order_id = hex::encode(bet_id);

    if is_deposit {
        let from = Address::from_slice(&data[12..32]);
        let amount = U256::from_be_slice(&data[32..64]);
        return Ok(Some(ChainEvent::Deposit(NewDeposit {
            tx_hash,
            block_number,
            contract_order_id: order_id,
            user_wallet: from.to_string(),
            deposit_amount: units_to_amount(amount)?,
            fund_currency: DEPOSIT_CURRENCY.to_string(),
        })));
    }

    let payout = U256::from_be_slice(&data[0..32]);
    let fee = U256::from_be_slice(&data[32..64]);
    Ok(Some(ChainEvent::Settlement {
        notice: SettlementNotice {
            order_uuid: order_id,
            tx_hash,
            settlement_amount: units_to_amount(payout)?,
            manage_fee: units_to_amount(fee)?,
            gas_fee: 0.0,
        },
        block_number,
    }))
}

// ---------------------------------------------------------------------------
// Amounts and identifiers
// ---------------------------------------------------------------------------

/// 6-decimal integer units to dollars.
pub fn units_to_amount(units: U256) -> Result<f64, AppError> {
    let raw = u128::try_from(units)
        .ok()
        .and_then(|v| i128::try_from(v).ok())
        .and_then(|v| Decimal::try_from_i128_with_scale(v, USDC_DECIMALS).ok())
        .ok_or_else(|| AppError::UpstreamChain(format!("amount out of range: {units}")))?;
    raw.to_f64()
        .ok_or_else(|| AppError::UpstreamChain(format!("amount not representable: {units}")))
}

/// Dollars to 6-decimal integer units, rounded to the nearest unit.
pub fn amount_to_units(amount: f64) -> Result<U256, AppError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(AppError::InvalidInput(format!("invalid amount: {amount}")));
    }
    let scaled = Decimal::from_f64(amount)
        .and_then(|d| d.checked_mul(Decimal::from(10u64.pow(USDC_DECIMALS))))
        .map(|d| d.round())
        .and_then(|d| d.to_u128())
        .ok_or_else(|| AppError::InvalidInput(format!("amount out of range: {amount}")))?;
    Ok(U256::from(scaled))
}

/// Canonical form of a contract order id: 64 lowercase hex chars, no `0x`.
///
/// Anything shorter is rejected rather than left-padded, since padding
/// would address a different betId on chain.
pub fn normalize_order_id(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .to_lowercase();
    if body.len() != 64 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::InvalidInput(format!(
            "contract_order_id must be 64 hex characters, got {:?}",
            raw
        )));
    }
    Ok(body)
}

pub fn bet_id(order_id: &str) -> Result<B256, AppError> {
    let normalized = normalize_order_id(order_id)?;
    B256::from_str(&normalized)
        .map_err(|e| AppError::InvalidInput(format!("invalid contract_order_id: {e}")))
}

pub fn parse_address(raw: &str) -> Result<Address, AppError> {
    Address::from_str(raw.trim())
        .map_err(|e| AppError::InvalidInput(format!("invalid address {raw:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
