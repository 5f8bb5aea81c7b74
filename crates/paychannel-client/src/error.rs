//! Error type of the channel engine.

use crate::protocol::Action;
use paychannel_core::{CryptoError, LedgerError};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by channel lifecycle operations
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Bad caller-supplied parameters, e.g. a zero deposit
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The transport did not acknowledge delivery of a message
    #[error("Message not delivered: {0}")]
    Undelivered(Action),

    /// The counterparty sent bad terms, a bad signature or lacks funds
    #[error("Counterparty protocol error: {0}")]
    CounterpartyProtocol(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Ledger transaction error: {0}")]
    LedgerTransaction(#[from] LedgerError),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Malformed(err.to_string())
    }
}
