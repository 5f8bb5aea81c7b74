//! Cryptographic primitives for the channel protocol.
//!
//! This module provides:
//! - Fixed-size byte types (Address, ChannelId, Seed, Hash32, Signature, TxHash)
//! - Packed keccak hashing of typed tuples
//! - The local signing Identity and signer recovery
//! - The counterparty's VerifierKey descriptor

pub mod abi;
mod identity;
mod primitives;

pub use abi::{keccak256, keccak_packed, Token};
pub use identity::{address_of, recover_signer, verify_signer, Identity};
pub use primitives::{
    hex_array, hex_vec, Address, ChannelId, Hash32, ParseHexError, Seed, Signature, TxHash,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from signing and verification
#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("No verifier key loaded")]
    NoVerifierKey,

    #[error("Crypto worker unavailable")]
    WorkerUnavailable,
}

/// Counterparty's public verification key, as published in the open terms
///
/// Big-endian RSA modulus and public exponent. The ledger contract stores
/// both so it can check randomness signatures during a dispute.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierKey {
    #[serde(with = "hex_vec")]
    pub modulus: Vec<u8>,
    #[serde(with = "hex_vec")]
    pub exponent: Vec<u8>,
}

impl fmt::Debug for VerifierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VerifierKey(n={} bits, e=0x{})",
            self.modulus.len() * 8,
            hex::encode(&self.exponent)
        )
    }
}
