//! Signature handling for the hashes a token owner signs during a migration.
//!
//! Owners sign the 32 hash bytes with their wallet's `personal_sign`, so recovery applies the EIP-191 prefix.

use alloy::primitives::{Address, B256, Bytes, PrimitiveSignature};
use anyhow::{Result, anyhow};

pub const SIGNATURE_LEN: usize = 65;

pub fn parse_signature(signature: &[u8]) -> Result<PrimitiveSignature> {
    if signature.len() != SIGNATURE_LEN {
        return Err(anyhow!(
            "signature must be {SIGNATURE_LEN} bytes, got {}",
            signature.len()
        ));
    }
    Ok(PrimitiveSignature::from_raw(signature)?)
}

/// Recover the address that signed `hash` as a personal message.
pub fn recover_signer(hash: B256, signature: &Bytes) -> Result<Address> {
    let signature = parse_signature(signature)?;
    Ok(signature.recover_address_from_msg(hash.as_slice())?)
}
