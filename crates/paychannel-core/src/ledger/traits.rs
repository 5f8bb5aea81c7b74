//! Ledger client trait definition.

use super::tx::PendingTx;
use crate::amount::as_decimal;
use crate::crypto::{Address, ChannelId, Seed, Signature, VerifierKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from ledger operations
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Transaction dropped before confirmation")]
    TransactionDropped,

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Sender and gas parameters for a submitted transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOptions {
    pub from: Address,
    pub gas_limit: u64,
    pub gas_price: u64,
}

/// Arguments of the ledger's `openChannel`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelCall {
    pub channel_id: ChannelId,
    pub player: Address,
    pub counterparty: Address,
    #[serde(with = "as_decimal")]
    pub player_deposit: u128,
    #[serde(with = "as_decimal")]
    pub counterparty_deposit: u128,
    pub opening_block: u64,
    pub game_data: Vec<u64>,
    pub verifier_key: VerifierKey,
    /// Counterparty's signature over the open terms
    pub signature: Signature,
}

/// Arguments of the ledger's `closeByConsent`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseChannelCall {
    pub channel_id: ChannelId,
    #[serde(with = "as_decimal")]
    pub player_balance: u128,
    #[serde(with = "as_decimal")]
    pub counterparty_balance: u128,
    #[serde(with = "as_decimal")]
    pub total_bet: u128,
    pub session: u64,
    pub is_final: bool,
    /// Counterparty's signature over the close hash
    pub signature: Signature,
}

/// Arguments of the ledger's `updateChannel`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateChannelCall {
    pub channel_id: ChannelId,
    #[serde(with = "as_decimal")]
    pub player_balance: u128,
    #[serde(with = "as_decimal")]
    pub counterparty_balance: u128,
    #[serde(with = "as_decimal")]
    pub total_bet: u128,
    pub session: u64,
    /// Counterparty's signature over the state hash
    pub signature: Signature,
}

/// Arguments of the ledger's `openDispute`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeCall {
    pub channel_id: ChannelId,
    pub session: u64,
    #[serde(with = "as_decimal")]
    pub wager: u128,
    pub payload: Vec<u64>,
    pub seed: Seed,
    /// Player's own signature over the disputed round
    pub signature: Signature,
}

/// Channel record as stored by the ledger contract
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainChannel {
    pub session: u64,
    #[serde(with = "as_decimal")]
    pub total_bet: u128,
    #[serde(with = "as_decimal")]
    pub player_balance: u128,
    #[serde(with = "as_decimal")]
    pub counterparty_balance: u128,
    pub is_open: bool,
}

/// Native coin and stake-token balances of an account
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalances {
    #[serde(with = "as_decimal")]
    pub native: u128,
    #[serde(with = "as_decimal")]
    pub token: u128,
}

/// Trait for ledger contract operations
///
/// Reads resolve immediately. Every state-changing call returns a
/// [`PendingTx`] that streams the submission and confirmation events of the
/// transaction; once submitted a transaction cannot be cancelled.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Address of the channel contract (spender for stake-token allowances)
    fn contract_address(&self) -> Address;

    async fn block_number(&self) -> Result<u64, LedgerError>;

    async fn balances(&self, owner: &Address) -> Result<AccountBalances, LedgerError>;

    async fn allowance(&self, owner: &Address, spender: &Address) -> Result<u128, LedgerError>;

    /// Approve `spender` to move `amount` stake tokens of `options.from`
    async fn approve(
        &self,
        spender: &Address,
        amount: u128,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError>;

    async fn open_channel(
        &self,
        call: OpenChannelCall,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError>;

    async fn close_by_consent(
        &self,
        call: CloseChannelCall,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError>;

    async fn update_channel(
        &self,
        call: UpdateChannelCall,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError>;

    async fn open_dispute(
        &self,
        call: DisputeCall,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError>;

    async fn read_channel(&self, channel_id: &ChannelId) -> Result<OnChainChannel, LedgerError>;
}
