//! EIP-191 personal-message signatures.

use alloy::primitives::{Address, Signature};

use crate::types::AppError;

/// Address that signed `message` (Ethereum-prefixed, Keccak-256).
pub fn recover_signer(message: &str, signature_hex: &str) -> Result<Address, AppError> {
    let raw = hex::decode(signature_hex.trim().trim_start_matches("0x"))
        .map_err(|e| AppError::InvalidInput(format!("signature is not hex: {e}")))?;
    if raw.len() != 65 {
        return Err(AppError::InvalidInput(format!(
            "signature must be 65 bytes, got {}",
            raw.len()
        )));
    }
    let signature = Signature::from_raw(&raw)
        .map_err(|e| AppError::InvalidInput(format!("malformed signature: {e}")))?;
    signature
        .recover_address_from_msg(message.as_bytes())
        .map_err(|e| AppError::InvalidInput(format!("signature recovery failed: {e}")))
}

/// Fail unless `message` was signed by `wallet` (compared case-insensitively).
pub fn verify_signer(message: &str, signature_hex: &str, wallet: &str) -> Result<(), AppError> {
    let signer = recover_signer(message, signature_hex)?;
    let expected = wallet.trim().to_lowercase();
    if format!("{signer:#x}") != expected {
        return Err(AppError::InvalidInput(format!(
            "signature signer {signer} does not match deposit wallet {wallet}"
        )));
    }
    Ok(())
}
