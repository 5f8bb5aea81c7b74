//! RPC client for a ledger gateway node.
//!
//! This module provides a real implementation of `LedgerClient` that talks
//! JSON-RPC to a gateway in front of the channel contract. The gateway
//! builds, signs and broadcasts contract transactions; this client only
//! submits the call arguments and then polls for confirmations.

use super::traits::{
    AccountBalances, CloseChannelCall, DisputeCall, LedgerClient, LedgerError, OnChainChannel,
    OpenChannelCall, TxOptions, UpdateChannelCall,
};
use super::tx::{PendingTx, TxEvent, TxEventSender};
use crate::crypto::{Address, ChannelId, TxHash};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Receipt status reported by the gateway
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    /// Broadcast but not mined yet
    Pending,
    /// Mined; `confirmations` counts blocks on top
    Mined,
    /// Reverted or dropped
    Failed,
}

#[derive(Clone, Debug, Deserialize)]
struct ReceiptResponse {
    status: ReceiptStatus,
    #[serde(default)]
    confirmations: u64,
    #[serde(default)]
    error: Option<String>,
}

/// RPC client for a ledger gateway
pub struct RpcLedgerClient {
    inner: Arc<RpcInner>,
    contract: Address,
    poll_interval: Duration,
    /// Stop polling once this many confirmations have been reported
    track_confirmations: u64,
}

struct RpcInner {
    client: Client,
    rpc_url: String,
    next_id: AtomicU64,
}

impl RpcLedgerClient {
    /// Create a new RPC client
    pub fn new(rpc_url: impl Into<String>, contract: Address) -> Self {
        Self {
            inner: Arc::new(RpcInner {
                client: Client::new(),
                rpc_url: rpc_url.into(),
                next_id: AtomicU64::new(1),
            }),
            contract,
            poll_interval: Duration::from_secs(2),
            track_confirmations: 12,
        }
    }

    /// Override how often receipts are polled and how deep they are tracked
    pub fn with_polling(mut self, poll_interval: Duration, track_confirmations: u64) -> Self {
        self.poll_interval = poll_interval;
        self.track_confirmations = track_confirmations;
        self
    }

    async fn send_transaction(
        &self,
        method: &str,
        call: Value,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        let result = self.inner.call(method, transaction_params(call, options)).await?;
        let hash: TxHash = result
            .get("tx_hash")
            .cloned()
            .ok_or_else(|| LedgerError::NetworkError("No tx_hash in response".to_string()))
            .and_then(|v| serde_json::from_value(v).map_err(|e| LedgerError::NetworkError(e.to_string())))?;

        let (sender, pending) = PendingTx::channel();
        let _ = sender.send(TxEvent::Submitted(hash));
        tokio::spawn(poll_receipt(
            self.inner.clone(),
            hash,
            sender,
            self.poll_interval,
            self.track_confirmations,
        ));
        Ok(pending)
    }
}

impl RpcInner {
    /// Make a JSON-RPC call
    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": [params]
        });

        debug!(method, "ledger rpc request");

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::NetworkError(e.to_string()))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| LedgerError::NetworkError(e.to_string()))?;

        if let Some(error) = result.get("error") {
            let msg = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error");
            return Err(LedgerError::NetworkError(msg.to_string()));
        }

        result
            .get("result")
            .cloned()
            .ok_or_else(|| LedgerError::NetworkError("No result in response".to_string()))
    }

    async fn call_typed<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| LedgerError::NetworkError(e.to_string()))
    }
}

/// Merge contract call arguments with sender and gas options
fn transaction_params(call: Value, options: TxOptions) -> Value {
    json!({
        "call": call,
        "from": options.from,
        "gas": format!("0x{:x}", options.gas_limit),
        "gasPrice": format!("0x{:x}", options.gas_price),
    })
}

fn to_params<T: Serialize>(call: &T) -> Result<Value, LedgerError> {
    serde_json::to_value(call).map_err(|e| LedgerError::NetworkError(e.to_string()))
}

/// Poll the gateway and forward each new confirmation depth
async fn poll_receipt(
    rpc: Arc<RpcInner>,
    hash: TxHash,
    sender: TxEventSender,
    poll_interval: Duration,
    track_confirmations: u64,
) {
    let mut reported = 0;
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        ticker.tick().await;
        if sender.is_closed() {
            return;
        }

        let receipt: ReceiptResponse = match rpc
            .call_typed("ledger_getTransactionReceipt", json!({ "tx_hash": hash }))
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(tx = %hash, error = %e, "receipt poll failed, retrying");
                continue;
            }
        };

        match receipt.status {
            ReceiptStatus::Pending => {}
            ReceiptStatus::Mined => {
                while reported < receipt.confirmations.min(track_confirmations) {
                    reported += 1;
                    if sender
                        .send(TxEvent::Confirmation {
                            hash,
                            confirmations: reported,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                if reported >= track_confirmations {
                    return;
                }
            }
            ReceiptStatus::Failed => {
                let reason = receipt.error.unwrap_or_else(|| "transaction failed".to_string());
                let _ = sender.send(TxEvent::Failed(reason));
                return;
            }
        }
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    fn contract_address(&self) -> Address {
        self.contract
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.inner.call_typed("ledger_blockNumber", json!({})).await
    }

    async fn balances(&self, owner: &Address) -> Result<AccountBalances, LedgerError> {
        self.inner
            .call_typed("ledger_getBalances", json!({ "owner": owner }))
            .await
    }

    async fn allowance(&self, owner: &Address, spender: &Address) -> Result<u128, LedgerError> {
        let value: String = self
            .inner
            .call_typed(
                "ledger_allowance",
                json!({ "owner": owner, "spender": spender }),
            )
            .await?;
        value
            .parse()
            .map_err(|_| LedgerError::NetworkError(format!("invalid allowance: {}", value)))
    }

    async fn approve(
        &self,
        spender: &Address,
        amount: u128,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        let call = json!({ "spender": spender, "amount": amount.to_string() });
        self.send_transaction("ledger_approve", call, options).await
    }

    async fn open_channel(
        &self,
        call: OpenChannelCall,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        self.send_transaction("ledger_openChannel", to_params(&call)?, options)
            .await
    }

    async fn close_by_consent(
        &self,
        call: CloseChannelCall,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        self.send_transaction("ledger_closeByConsent", to_params(&call)?, options)
            .await
    }

    async fn update_channel(
        &self,
        call: UpdateChannelCall,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        self.send_transaction("ledger_updateChannel", to_params(&call)?, options)
            .await
    }

    async fn open_dispute(
        &self,
        call: DisputeCall,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        self.send_transaction("ledger_openDispute", to_params(&call)?, options)
            .await
    }

    async fn read_channel(&self, channel_id: &ChannelId) -> Result<OnChainChannel, LedgerError> {
        let record: Option<OnChainChannel> = self
            .inner
            .call_typed("ledger_getChannel", json!({ "channel_id": channel_id }))
            .await?;
        record.ok_or(LedgerError::ChannelNotFound(*channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Seed, Signature};

    #[test]
    fn test_transaction_params_shape() {
        let call = DisputeCall {
            channel_id: ChannelId::from_bytes([1; 32]),
            session: 4,
            wager: 25,
            payload: vec![3000],
            seed: Seed::from_bytes([2; 32]),
            signature: Signature::from_bytes([0; 65]),
        };
        let options = TxOptions {
            from: Address::from_bytes([9; 20]),
            gas_limit: 4_600_000,
            gas_price: 255,
        };

        let params = transaction_params(to_params(&call).unwrap(), options);

        assert_eq!(params["gas"], "0x4630c0");
        assert_eq!(params["gasPrice"], "0xff");
        assert_eq!(params["from"], format!("0x{}", "09".repeat(20)));
        assert_eq!(params["call"]["wager"], "25");
        assert_eq!(params["call"]["session"], 4);
    }

    #[test]
    fn test_receipt_status_deserialization() {
        let receipt: ReceiptResponse =
            serde_json::from_str(r#"{"status":"mined","confirmations":3}"#).unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Mined);
        assert_eq!(receipt.confirmations, 3);

        let receipt: ReceiptResponse =
            serde_json::from_str(r#"{"status":"failed","error":"reverted"}"#).unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert_eq!(receipt.error.as_deref(), Some("reverted"));
    }
}
