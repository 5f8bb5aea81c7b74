//! Paychannel Core Library
//!
//! Shared primitives for payment channel clients:
//! - Fixed-size byte types, packed keccak hashing and signing identities
//! - Decimal-string serde for token amounts
//! - LedgerClient trait, MockLedger and RpcLedgerClient

pub mod amount;
pub mod crypto;
pub mod ledger;

pub use crypto::{Address, ChannelId, CryptoError, Hash32, Identity, Seed, Signature, TxHash, VerifierKey};
pub use ledger::{LedgerClient, LedgerError, MockLedger, PendingTx, RpcLedgerClient, TxEvent, TxReceipt};
