//! Shared setup for the integration tests: one mock ledger, one in-memory
//! network, funded bankrollers and players.

#![allow(dead_code)]

use paychannel_client::{
    BankrollerBehavior, BankrollerHandle, ChannelConfig, ChannelController, DiceGame,
    MemoryNetwork, MockBankroller, StatusEvent,
};
use paychannel_core::{Identity, MockLedger};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const ETHER: u128 = 1_000_000_000_000_000_000;
pub const PLAYER_DEPOSIT: u128 = ETHER;
pub const WAGER: u128 = ETHER / 100;
pub const STARTING_TOKENS: u128 = 1_000 * ETHER;
pub const BANKROLL: u128 = 100 * ETHER;
/// Even odds on the dice game
pub const HALF_CHANCE: u64 = 32_768;

pub struct Harness {
    pub config: ChannelConfig,
    pub ledger: MockLedger,
    pub network: MemoryNetwork,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        Self {
            config,
            ledger: MockLedger::new(3),
            network: MemoryNetwork::new(),
        }
    }

    pub async fn bankroller(&self, capacity: u128, behavior: BankrollerBehavior) -> BankrollerHandle {
        let identity = Identity::generate();
        self.ledger
            .fund(identity.address(), ETHER, STARTING_TOKENS);
        MockBankroller::new(
            &self.config,
            identity,
            capacity,
            Arc::new(self.ledger.clone()),
            Arc::new(self.network.clone()),
        )
        .unwrap()
        .with_behavior(behavior)
        .spawn()
        .await
        .unwrap()
    }

    pub fn player(&self) -> ChannelController {
        let identity = Identity::generate();
        self.ledger
            .fund(identity.address(), ETHER, STARTING_TOKENS);
        self.controller(identity)
    }

    pub fn unfunded_player(&self) -> ChannelController {
        self.controller(Identity::generate())
    }

    fn controller(&self, identity: Identity) -> ChannelController {
        ChannelController::new(
            self.config.clone(),
            identity,
            Arc::new(self.ledger.clone()),
            Arc::new(self.network.clone()),
            Box::new(DiceGame),
        )
        .unwrap()
    }
}

pub fn test_config() -> ChannelConfig {
    ChannelConfig {
        handshake_timeout_ms: 2_000,
        discovery_status_interval_ms: 100,
        ..ChannelConfig::default()
    }
}

/// Everything emitted so far
pub fn drain(events: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn statuses(events: &[StatusEvent]) -> Vec<&str> {
    events.iter().map(|e| e.status.as_str()).collect()
}
