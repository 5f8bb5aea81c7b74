//! Mock ledger for testing.

use super::traits::{
    AccountBalances, CloseChannelCall, DisputeCall, LedgerClient, LedgerError, OnChainChannel,
    OpenChannelCall, TxOptions, UpdateChannelCall,
};
use super::tx::{PendingTx, TxEvent};
use crate::crypto::{Address, ChannelId, TxHash};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A transaction submitted to the mock ledger
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerCall {
    Approve {
        owner: Address,
        spender: Address,
        amount: u128,
    },
    OpenChannel(OpenChannelCall),
    CloseByConsent(CloseChannelCall),
    UpdateChannel(UpdateChannelCall),
    OpenDispute(DisputeCall),
}

/// State of a channel held by the mock contract
#[derive(Clone, Debug)]
struct MockChannel {
    player: Address,
    counterparty: Address,
    record: OnChainChannel,
    /// Sum of both deposits; every settled state must split exactly this
    locked: u128,
    disputed: bool,
}

impl MockChannel {
    fn check_split(&self, player_balance: u128, counterparty_balance: u128) -> Result<(), String> {
        match player_balance.checked_add(counterparty_balance) {
            Some(total) if total == self.locked => Ok(()),
            _ => Err(format!(
                "balances {} + {} do not match locked {}",
                player_balance, counterparty_balance, self.locked
            )),
        }
    }
}

struct MockLedgerState {
    block_number: u64,
    native: HashMap<Address, u128>,
    tokens: HashMap<Address, u128>,
    allowances: HashMap<(Address, Address), u128>,
    channels: HashMap<ChannelId, MockChannel>,
    calls: Vec<LedgerCall>,
    fail_next: Option<String>,
}

/// In-memory mock of the channel contract and its stake token
///
/// Each transaction is applied at submission and then reports
/// `confirmations_to_emit` confirmations, one per event, so consumers see
/// the required depth crossed and then exceeded.
#[derive(Clone)]
pub struct MockLedger {
    inner: Arc<Mutex<MockLedgerState>>,
    contract: Address,
    confirmations_to_emit: u64,
}

impl MockLedger {
    /// Create a mock ledger that reports `confirmations_to_emit` confirmations per transaction
    pub fn new(confirmations_to_emit: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockLedgerState {
                block_number: 1,
                native: HashMap::new(),
                tokens: HashMap::new(),
                allowances: HashMap::new(),
                channels: HashMap::new(),
                calls: Vec::new(),
                fail_next: None,
            })),
            contract: Address::from_bytes([0xcc; 20]),
            confirmations_to_emit,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockLedgerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Credit native coins and stake tokens to an account
    pub fn fund(&self, owner: Address, native: u128, token: u128) {
        let mut state = self.state();
        *state.native.entry(owner).or_insert(0) += native;
        *state.tokens.entry(owner).or_insert(0) += token;
    }

    /// Set an allowance directly, without a transaction
    pub fn set_allowance(&self, owner: Address, spender: Address, amount: u128) {
        self.state().allowances.insert((owner, spender), amount);
    }

    pub fn token_balance(&self, owner: &Address) -> u128 {
        self.state().tokens.get(owner).copied().unwrap_or(0)
    }

    /// Overwrite the stored record of a channel (for testing)
    pub fn set_channel_record(&self, channel_id: &ChannelId, record: OnChainChannel) {
        if let Some(channel) = self.state().channels.get_mut(channel_id) {
            channel.record = record;
        }
    }

    pub fn is_disputed(&self, channel_id: &ChannelId) -> bool {
        self.state()
            .channels
            .get(channel_id)
            .map(|c| c.disputed)
            .unwrap_or(false)
    }

    /// Make the next submitted transaction fail with `reason`
    pub fn fail_next_transaction(&self, reason: impl Into<String>) {
        self.state().fail_next = Some(reason.into());
    }

    /// All transactions submitted so far
    pub fn calls(&self) -> Vec<LedgerCall> {
        self.state().calls.clone()
    }

    pub fn dispute_count(&self) -> usize {
        self.count_calls(|c| matches!(c, LedgerCall::OpenDispute(_)))
    }

    pub fn update_count(&self) -> usize {
        self.count_calls(|c| matches!(c, LedgerCall::UpdateChannel(_)))
    }

    pub fn channel_transaction_count(&self) -> usize {
        self.count_calls(|c| !matches!(c, LedgerCall::Approve { .. }))
    }

    fn count_calls(&self, predicate: impl Fn(&LedgerCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Record a call, apply it and produce its event stream
    fn submit<F>(&self, call: LedgerCall, apply: F) -> PendingTx
    where
        F: FnOnce(&mut MockLedgerState) -> Result<(), String>,
    {
        let (sender, pending) = PendingTx::channel();
        let hash = TxHash::random();

        let outcome = {
            let mut state = self.state();
            state.calls.push(call);
            state.block_number += 1;
            match state.fail_next.take() {
                Some(reason) => Err(reason),
                None => apply(&mut *state),
            }
        };

        // The receiver is still held by `pending`, so sends cannot fail here
        let _ = sender.send(TxEvent::Submitted(hash));
        match outcome {
            Ok(()) => {
                for confirmations in 1..=self.confirmations_to_emit {
                    let _ = sender.send(TxEvent::Confirmation {
                        hash,
                        confirmations,
                    });
                }
            }
            Err(reason) => {
                let _ = sender.send(TxEvent::Failed(reason));
            }
        }
        pending
    }
}

impl MockLedgerState {
    fn take_stake(&mut self, owner: Address, spender: Address, amount: u128) -> Result<(), String> {
        let allowance = self.allowances.get(&(owner, spender)).copied().unwrap_or(0);
        if allowance < amount {
            return Err(format!("insufficient allowance for {}", owner));
        }
        let balance = self.tokens.get(&owner).copied().unwrap_or(0);
        if balance < amount {
            return Err(format!("insufficient token balance for {}", owner));
        }
        self.allowances.insert((owner, spender), allowance - amount);
        self.tokens.insert(owner, balance - amount);
        Ok(())
    }

    fn open_channel_mut(&mut self, channel_id: &ChannelId) -> Result<&mut MockChannel, String> {
        match self.channels.get_mut(channel_id) {
            Some(channel) if channel.record.is_open => Ok(channel),
            Some(_) => Err(format!("channel {} is closed", channel_id)),
            None => Err(format!("channel {} not found", channel_id)),
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn contract_address(&self) -> Address {
        self.contract
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        Ok(self.state().block_number)
    }

    async fn balances(&self, owner: &Address) -> Result<AccountBalances, LedgerError> {
        let state = self.state();
        Ok(AccountBalances {
            native: state.native.get(owner).copied().unwrap_or(0),
            token: state.tokens.get(owner).copied().unwrap_or(0),
        })
    }

    async fn allowance(&self, owner: &Address, spender: &Address) -> Result<u128, LedgerError> {
        Ok(self
            .state()
            .allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or(0))
    }

    async fn approve(
        &self,
        spender: &Address,
        amount: u128,
        options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        let owner = options.from;
        let spender = *spender;
        Ok(self.submit(
            LedgerCall::Approve {
                owner,
                spender,
                amount,
            },
            move |state| {
                state.allowances.insert((owner, spender), amount);
                Ok(())
            },
        ))
    }

    async fn open_channel(
        &self,
        call: OpenChannelCall,
        _options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        let contract = self.contract;
        let applied = call.clone();
        Ok(self.submit(LedgerCall::OpenChannel(call), move |state| {
            if state.channels.contains_key(&applied.channel_id) {
                return Err(format!("channel {} already exists", applied.channel_id));
            }
            state.take_stake(applied.player, contract, applied.player_deposit)?;
            state.take_stake(applied.counterparty, contract, applied.counterparty_deposit)?;
            state.channels.insert(
                applied.channel_id,
                MockChannel {
                    player: applied.player,
                    counterparty: applied.counterparty,
                    record: OnChainChannel {
                        session: 0,
                        total_bet: 0,
                        player_balance: applied.player_deposit,
                        counterparty_balance: applied.counterparty_deposit,
                        is_open: true,
                    },
                    locked: applied
                        .player_deposit
                        .saturating_add(applied.counterparty_deposit),
                    disputed: false,
                },
            );
            Ok(())
        }))
    }

    async fn close_by_consent(
        &self,
        call: CloseChannelCall,
        _options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        let applied = call.clone();
        Ok(self.submit(LedgerCall::CloseByConsent(call), move |state| {
            let channel = state.open_channel_mut(&applied.channel_id)?;
            channel.check_split(applied.player_balance, applied.counterparty_balance)?;
            channel.record = OnChainChannel {
                session: applied.session,
                total_bet: applied.total_bet,
                player_balance: applied.player_balance,
                counterparty_balance: applied.counterparty_balance,
                is_open: false,
            };
            let (player, counterparty) = (channel.player, channel.counterparty);
            *state.tokens.entry(player).or_insert(0) += applied.player_balance;
            *state.tokens.entry(counterparty).or_insert(0) += applied.counterparty_balance;
            Ok(())
        }))
    }

    async fn update_channel(
        &self,
        call: UpdateChannelCall,
        _options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        let applied = call.clone();
        Ok(self.submit(LedgerCall::UpdateChannel(call), move |state| {
            let channel = state.open_channel_mut(&applied.channel_id)?;
            if applied.session < channel.record.session {
                return Err(format!(
                    "stale session {} < {}",
                    applied.session, channel.record.session
                ));
            }
            channel.check_split(applied.player_balance, applied.counterparty_balance)?;
            channel.record.session = applied.session;
            channel.record.total_bet = applied.total_bet;
            channel.record.player_balance = applied.player_balance;
            channel.record.counterparty_balance = applied.counterparty_balance;
            Ok(())
        }))
    }

    async fn open_dispute(
        &self,
        call: DisputeCall,
        _options: TxOptions,
    ) -> Result<PendingTx, LedgerError> {
        let channel_id = call.channel_id;
        Ok(self.submit(LedgerCall::OpenDispute(call), move |state| {
            state.open_channel_mut(&channel_id)?.disputed = true;
            Ok(())
        }))
    }

    async fn read_channel(&self, channel_id: &ChannelId) -> Result<OnChainChannel, LedgerError> {
        self.state()
            .channels
            .get(channel_id)
            .map(|c| c.record)
            .ok_or(LedgerError::ChannelNotFound(*channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Seed, Signature, VerifierKey};

    fn options(from: Address) -> TxOptions {
        TxOptions {
            from,
            gas_limit: 4_600_000,
            gas_price: 1,
        }
    }

    fn open_call(player: Address, counterparty: Address) -> OpenChannelCall {
        OpenChannelCall {
            channel_id: ChannelId::random(),
            player,
            counterparty,
            player_deposit: 100,
            counterparty_deposit: 200,
            opening_block: 1,
            game_data: vec![0],
            verifier_key: VerifierKey {
                modulus: vec![1, 2, 3],
                exponent: vec![1, 0, 1],
            },
            signature: Signature::from_bytes([0u8; 65]),
        }
    }

    fn funded_ledger() -> (MockLedger, Address, Address) {
        let ledger = MockLedger::new(3);
        let player = Address::from_bytes([1; 20]);
        let counterparty = Address::from_bytes([2; 20]);
        ledger.fund(player, 10, 1_000);
        ledger.fund(counterparty, 10, 1_000);
        ledger.set_allowance(player, ledger.contract_address(), 100);
        ledger.set_allowance(counterparty, ledger.contract_address(), 200);
        (ledger, player, counterparty)
    }

    #[tokio::test]
    async fn test_open_locks_both_deposits() {
        let (ledger, player, counterparty) = funded_ledger();
        let call = open_call(player, counterparty);
        let channel_id = call.channel_id;

        let pending = ledger.open_channel(call, options(player)).await.unwrap();
        let receipt = pending.confirmed(2, |_| {}).await.unwrap();
        assert_eq!(receipt.confirmations, 2);

        assert_eq!(ledger.token_balance(&player), 900);
        assert_eq!(ledger.token_balance(&counterparty), 800);
        let record = ledger.read_channel(&channel_id).await.unwrap();
        assert!(record.is_open);
        assert_eq!(record.counterparty_balance, 200);
    }

    #[tokio::test]
    async fn test_open_without_allowance_fails() {
        let (ledger, player, counterparty) = funded_ledger();
        ledger.set_allowance(counterparty, ledger.contract_address(), 0);

        let pending = ledger
            .open_channel(open_call(player, counterparty), options(player))
            .await
            .unwrap();
        let result = pending.confirmed(1, |_| {}).await;
        assert!(matches!(result, Err(LedgerError::TransactionFailed(_))));
    }

    #[tokio::test]
    async fn test_close_pays_out_final_balances() {
        let (ledger, player, counterparty) = funded_ledger();
        let call = open_call(player, counterparty);
        let channel_id = call.channel_id;
        ledger
            .open_channel(call, options(player))
            .await
            .unwrap()
            .confirmed(1, |_| {})
            .await
            .unwrap();

        let close = CloseChannelCall {
            channel_id,
            player_balance: 150,
            counterparty_balance: 150,
            total_bet: 50,
            session: 3,
            is_final: true,
            signature: Signature::from_bytes([0u8; 65]),
        };
        ledger
            .close_by_consent(close, options(player))
            .await
            .unwrap()
            .confirmed(1, |_| {})
            .await
            .unwrap();

        assert_eq!(ledger.token_balance(&player), 1_050);
        assert_eq!(ledger.token_balance(&counterparty), 950);
        assert!(!ledger.read_channel(&channel_id).await.unwrap().is_open);
    }

    #[tokio::test]
    async fn test_close_rejects_balances_beyond_deposits() {
        let (ledger, player, counterparty) = funded_ledger();
        let call = open_call(player, counterparty);
        let channel_id = call.channel_id;
        ledger
            .open_channel(call, options(player))
            .await
            .unwrap()
            .confirmed(1, |_| {})
            .await
            .unwrap();

        let close = CloseChannelCall {
            channel_id,
            player_balance: 6_554_500,
            counterparty_balance: 0,
            total_bet: 100,
            session: 1,
            is_final: true,
            signature: Signature::from_bytes([0u8; 65]),
        };
        let result = ledger
            .close_by_consent(close, options(player))
            .await
            .unwrap()
            .confirmed(1, |_| {})
            .await;

        assert!(matches!(result, Err(LedgerError::TransactionFailed(_))));
        assert_eq!(ledger.token_balance(&player), 900);
        assert_eq!(ledger.token_balance(&counterparty), 800);
        assert!(ledger.read_channel(&channel_id).await.unwrap().is_open);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let (ledger, player, _) = funded_ledger();
        ledger.fail_next_transaction("out of gas");

        let dispute = DisputeCall {
            channel_id: ChannelId::random(),
            session: 1,
            wager: 1,
            payload: vec![],
            seed: Seed::random(),
            signature: Signature::from_bytes([0u8; 65]),
        };
        let result = ledger
            .open_dispute(dispute, options(player))
            .await
            .unwrap()
            .confirmed(1, |_| {})
            .await;
        assert!(matches!(result, Err(LedgerError::TransactionFailed(r)) if r == "out of gas"));

        let approve = ledger
            .approve(&ledger.contract_address(), 5, options(player))
            .await
            .unwrap()
            .confirmed(1, |_| {})
            .await;
        assert!(approve.is_ok());
        assert_eq!(ledger.dispute_count(), 1);
    }
}
