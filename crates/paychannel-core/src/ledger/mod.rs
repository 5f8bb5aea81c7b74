//! Ledger contract client abstraction.

mod mock;
mod rpc;
mod traits;
mod tx;

pub use mock::{LedgerCall, MockLedger};
pub use rpc::{ReceiptStatus, RpcLedgerClient};
pub use traits::{
    AccountBalances, CloseChannelCall, DisputeCall, LedgerClient, LedgerError, OnChainChannel,
    OpenChannelCall, TxOptions, UpdateChannelCall,
};
pub use tx::{ConfirmationGate, PendingTx, TxEvent, TxEventSender, TxReceipt};
