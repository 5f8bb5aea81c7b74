//! Transaction observation: submission, confirmations, failure.

use super::traits::LedgerError;
use crate::crypto::TxHash;
use tokio::sync::mpsc;
use tracing::debug;

/// Event emitted while a transaction makes its way on-chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxEvent {
    /// The transaction hash is known
    Submitted(TxHash),
    /// The transaction has `confirmations` blocks on top of it
    Confirmation { hash: TxHash, confirmations: u64 },
    /// The transaction was rejected or reverted
    Failed(String),
}

/// Outcome of a confirmed transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: TxHash,
    pub confirmations: u64,
}

/// Turns a stream of [`TxEvent`]s into a single outcome.
///
/// Ledgers report every new confirmation, so the same transaction crosses
/// the required depth once and then keeps producing notifications. The gate
/// settles on the first qualifying event and ignores everything after it.
#[derive(Debug)]
pub struct ConfirmationGate {
    required: u64,
    hash: Option<TxHash>,
    settled: bool,
}

impl ConfirmationGate {
    pub fn new(required: u64) -> Self {
        Self {
            required,
            hash: None,
            settled: false,
        }
    }

    /// Feed one event; returns the outcome only the first time it is decided
    pub fn observe(&mut self, event: &TxEvent) -> Option<Result<TxReceipt, LedgerError>> {
        if self.settled {
            return None;
        }

        match event {
            TxEvent::Submitted(hash) => {
                self.hash = Some(*hash);
                None
            }
            TxEvent::Confirmation {
                hash,
                confirmations,
            } if *confirmations >= self.required => {
                self.settled = true;
                Some(Ok(TxReceipt {
                    hash: *hash,
                    confirmations: *confirmations,
                }))
            }
            TxEvent::Confirmation { .. } => None,
            TxEvent::Failed(reason) => {
                self.settled = true;
                Some(Err(LedgerError::TransactionFailed(reason.clone())))
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Hash seen in the `Submitted` event, if any
    pub fn hash(&self) -> Option<TxHash> {
        self.hash
    }
}

/// Sending half used by ledger implementations to report progress
pub type TxEventSender = mpsc::UnboundedSender<TxEvent>;

/// A submitted transaction whose events have not been consumed yet
#[derive(Debug)]
pub struct PendingTx {
    events: mpsc::UnboundedReceiver<TxEvent>,
}

impl PendingTx {
    /// Create a linked sender / pending transaction pair
    pub fn channel() -> (TxEventSender, PendingTx) {
        let (sender, events) = mpsc::unbounded_channel();
        (sender, PendingTx { events })
    }

    /// Wait until the transaction has `required` confirmations.
    ///
    /// `on_submitted` runs when the transaction hash becomes known.
    pub async fn confirmed<F>(mut self, required: u64, mut on_submitted: F) -> Result<TxReceipt, LedgerError>
    where
        F: FnMut(&TxHash),
    {
        let mut gate = ConfirmationGate::new(required);
        while let Some(event) = self.events.recv().await {
            match &event {
                TxEvent::Submitted(hash) => {
                    debug!(tx = %hash, "Transaction submitted");
                    on_submitted(hash);
                }
                TxEvent::Confirmation {
                    hash,
                    confirmations,
                } => {
                    debug!(tx = %hash, confirmations, required, "Transaction confirmation");
                }
                TxEvent::Failed(reason) => {
                    debug!(reason = %reason, "Transaction failed");
                }
            }
            if let Some(outcome) = gate.observe(&event) {
                return outcome;
            }
        }
        Err(LedgerError::TransactionDropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation(hash: TxHash, confirmations: u64) -> TxEvent {
        TxEvent::Confirmation {
            hash,
            confirmations,
        }
    }

    #[test]
    fn test_gate_fires_exactly_once() {
        let hash = TxHash::random();
        let mut gate = ConfirmationGate::new(2);

        let mut fired = 0;
        let events = [
            TxEvent::Submitted(hash),
            confirmation(hash, 1),
            confirmation(hash, 2),
            confirmation(hash, 3),
            confirmation(hash, 4),
            confirmation(hash, 2),
        ];
        for event in &events {
            if gate.observe(event).is_some() {
                fired += 1;
            }
        }

        assert_eq!(fired, 1);
        assert!(gate.is_settled());
        assert_eq!(gate.hash(), Some(hash));
    }

    #[test]
    fn test_gate_failure_settles() {
        let mut gate = ConfirmationGate::new(1);
        let outcome = gate.observe(&TxEvent::Failed("reverted".into()));
        assert!(matches!(outcome, Some(Err(LedgerError::TransactionFailed(_)))));
        assert!(gate.observe(&confirmation(TxHash::random(), 5)).is_none());
    }

    #[tokio::test]
    async fn test_confirmed_reports_first_qualifying_depth() {
        let (sender, pending) = PendingTx::channel();
        let hash = TxHash::random();
        sender.send(TxEvent::Submitted(hash)).unwrap();
        for n in 1..=5 {
            sender.send(confirmation(hash, n)).unwrap();
        }
        drop(sender);

        let mut submitted = Vec::new();
        let receipt = pending.confirmed(3, |h| submitted.push(*h)).await.unwrap();

        assert_eq!(receipt.confirmations, 3);
        assert_eq!(submitted, vec![hash]);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_an_error() {
        let (sender, pending) = PendingTx::channel();
        sender.send(TxEvent::Submitted(TxHash::random())).unwrap();
        drop(sender);

        let result = pending.confirmed(1, |_| {}).await;
        assert!(matches!(result, Err(LedgerError::TransactionDropped)));
    }
}
