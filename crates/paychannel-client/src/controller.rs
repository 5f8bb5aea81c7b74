//! Channel lifecycle: open, play, close, update and dispute.

use crate::config::ChannelConfig;
use crate::connection::{ConnectTarget, ConnectionManager, PeerLink};
use crate::crypto_worker::CryptoWorker;
use crate::error::ChannelError;
use crate::events::{StatusEvent, StatusHub, StatusTopic};
use crate::gameplay::{GameplaySession, RoundContext, RoundError};
use crate::games::{Balances, GameLogic};
use crate::protocol::messages::{
    CheckOpenChannelRequest, CloseRequest, CloseResponse, OpenChannelRequest, OpenChannelResponse,
    StatusResponse,
};
use crate::protocol::{
    Action, ChannelDescriptor, ChannelState, ConnectionInfo, RoundInput, RoundReport, RoundRequest,
};
use crate::store::StateStore;
use crate::transport::TransportFactory;
use paychannel_core::ledger::{
    CloseChannelCall, DisputeCall, LedgerClient, OpenChannelCall, TxReceipt, UpdateChannelCall,
};
use paychannel_core::{Address, ChannelId, Identity, TxHash};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Closed,
    Opening,
    Open,
    Closing,
    /// A dispute was submitted; the ledger settles the channel
    Disputed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of [`ChannelController::update_channel`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// No co-signed state exists yet
    NothingToUpdate,
    /// The ledger no longer holds the channel open
    ChannelNotOpen,
    /// The ledger already reflects the latest state
    AlreadyCurrent,
    /// The ledger holds a later session than any state known locally
    LedgerAhead { on_chain: u64, local: u64 },
    Submitted(TxReceipt),
}

/// Player-side owner of one channel
///
/// Every lifecycle operation takes `&mut self`, so operations on a channel
/// never overlap.
pub struct ChannelController {
    config: ChannelConfig,
    address: Address,
    crypto: CryptoWorker,
    ledger: Arc<dyn LedgerClient>,
    connections: ConnectionManager,
    status: StatusHub,
    store: StateStore,
    gameplay: GameplaySession,
    peer: Option<PeerLink>,
    lifecycle: Lifecycle,
}

impl ChannelController {
    pub fn new(
        config: ChannelConfig,
        identity: Identity,
        ledger: Arc<dyn LedgerClient>,
        transports: Arc<dyn TransportFactory>,
        logic: Box<dyn GameLogic>,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let address = identity.address();
        let crypto = CryptoWorker::spawn(identity)?;
        let status = StatusHub::default();
        let connections =
            ConnectionManager::new(config.clone(), transports, crypto.clone(), status.clone());

        Ok(Self {
            config,
            address,
            crypto,
            ledger,
            connections,
            status,
            store: StateStore::new(),
            gameplay: GameplaySession::new(logic),
            peer: None,
            lifecycle: Lifecycle::Closed,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.peer.as_ref().map(|peer| &peer.info)
    }

    pub fn channel(&self) -> Option<&ChannelDescriptor> {
        self.connection_info().and_then(|info| info.channel.as_ref())
    }

    /// Latest co-signed state
    pub fn latest_state(&self) -> Option<ChannelState> {
        self.store.get()
    }

    /// Session number of the most recently started round
    pub fn session(&self) -> u64 {
        self.gameplay.session()
    }

    pub fn balances(&self) -> Balances {
        self.gameplay.paychannel().balances()
    }

    fn require(&self, expected: Lifecycle) -> Result<(), ChannelError> {
        if self.lifecycle != expected {
            return Err(ChannelError::InvalidState(format!(
                "channel is {}, expected {}",
                self.lifecycle, expected
            )));
        }
        Ok(())
    }

    fn peer(&self) -> Result<&PeerLink, ChannelError> {
        self.peer
            .as_ref()
            .ok_or_else(|| ChannelError::InvalidState("not connected".into()))
    }

    fn open_descriptor(&self) -> Result<&ChannelDescriptor, ChannelError> {
        self.channel()
            .ok_or_else(|| ChannelError::InvalidState("no channel opened".into()))
    }

    /// Find or contact a counterparty and establish the private room
    pub async fn connect(
        &mut self,
        target: ConnectTarget,
        deposit: u128,
    ) -> Result<ConnectionInfo, ChannelError> {
        if self.peer.is_some() {
            return Err(ChannelError::InvalidState("already connected".into()));
        }
        let link = self.connections.connect(target, deposit).await?;
        let info = link.info.clone();
        self.peer = Some(link);
        Ok(info)
    }

    /// Open a funded channel with the connected counterparty
    pub async fn open_channel(&mut self, deposit: u128) -> Result<ChannelDescriptor, ChannelError> {
        self.require(Lifecycle::Closed)?;
        self.peer()?;
        if deposit == 0 {
            self.status
                .emit(StatusTopic::ConnectError, "deposit null", json!({}));
            return Err(ChannelError::Validation("deposit null".into()));
        }

        self.lifecycle = Lifecycle::Opening;
        match self.open_channel_inner(deposit).await {
            Ok(descriptor) => {
                self.gameplay
                    .start(descriptor.player_deposit, descriptor.counterparty_deposit);
                self.store.clear();
                if let Some(peer) = self.peer.as_mut() {
                    peer.info.channel = Some(descriptor.clone());
                }
                self.lifecycle = Lifecycle::Open;
                self.status.emit(
                    StatusTopic::ConnectInfo,
                    "channelOpened",
                    json!({ "channel_id": descriptor.channel_id }),
                );
                info!(channel = %descriptor.channel_id, "channel open");
                Ok(descriptor)
            }
            Err(e) => {
                error!(error = %e, "failed to open channel");
                self.lifecycle = Lifecycle::Closed;
                Err(e)
            }
        }
    }

    async fn open_channel_inner(&self, deposit: u128) -> Result<ChannelDescriptor, ChannelError> {
        let peer = self.peer()?;
        let contract = self.ledger.contract_address();

        let balances = self.ledger.balances(&self.address).await?;
        if balances.native < self.config.min_native_balance {
            return Err(ChannelError::InsufficientFunds(format!(
                "native balance {} below minimum {}",
                balances.native, self.config.min_native_balance
            )));
        }
        if balances.token < deposit {
            return Err(ChannelError::InsufficientFunds(format!(
                "token balance {} below deposit {}",
                balances.token, deposit
            )));
        }

        self.status
            .emit(StatusTopic::ConnectInfo, "ERC20approve", json!({}));
        let allowance = self.ledger.allowance(&self.address, &contract).await?;
        if allowance < deposit {
            for amount in [0, deposit] {
                let options = self.config.tx_options(self.address, self.config.gas_limit_open);
                self.ledger
                    .approve(&contract, amount, options)
                    .await?
                    .confirmed(self.config.tx_confirmations, |hash| {
                        debug!(tx = %hash, amount = %amount, "approve submitted");
                    })
                    .await?;
            }
        }

        let request = OpenChannelRequest {
            channel_id: ChannelId::random(),
            player_address: self.address,
            player_deposit: deposit,
            game_data: self.config.game_data.clone(),
        };
        let reply = peer
            .bus
            .request(Action::OpenChannel, peer.info.counterparty, &request, true)
            .await?;
        let OpenChannelResponse { terms, signature } = reply.reply()?;

        if terms.counterparty_address != peer.info.counterparty {
            return Err(ChannelError::CounterpartyProtocol(format!(
                "terms name {} instead of {}",
                terms.counterparty_address, peer.info.counterparty
            )));
        }
        let required = self.config.required_counterparty_deposit(deposit);
        if terms.counterparty_deposit < required {
            self.status.emit(
                StatusTopic::ConnectError,
                "counterparty deposit too low",
                json!({
                    "counterparty_deposit": terms.counterparty_deposit.to_string(),
                    "player_deposit": deposit.to_string(),
                }),
            );
            return Err(ChannelError::CounterpartyProtocol(format!(
                "counterparty deposit {} below required {}",
                terms.counterparty_deposit, required
            )));
        }

        let terms_hash = request.terms_hash(&terms);
        let signed = self
            .crypto
            .verify_signature(terms_hash, signature, peer.info.counterparty)
            .await
            .unwrap_or(false);
        if !signed {
            error!(counterparty = %peer.info.counterparty, "invalid open channel signature");
            return Err(ChannelError::CounterpartyProtocol(
                "invalid open channel signature".into(),
            ));
        }
        self.crypto
            .load_verifier_key(terms.verifier_key.clone())
            .await
            .map_err(|e| ChannelError::CounterpartyProtocol(format!("verifier key: {}", e)))?;

        let counterparty_allowance = self
            .ledger
            .allowance(&terms.counterparty_address, &contract)
            .await?;
        if counterparty_allowance < terms.counterparty_deposit {
            return Err(ChannelError::CounterpartyProtocol(format!(
                "counterparty allowance {} below deposit {}",
                counterparty_allowance, terms.counterparty_deposit
            )));
        }
        let counterparty_balance = self.ledger.balances(&terms.counterparty_address).await?;
        if counterparty_balance.token < terms.counterparty_deposit {
            return Err(ChannelError::CounterpartyProtocol(format!(
                "counterparty balance {} below deposit {}",
                counterparty_balance.token, terms.counterparty_deposit
            )));
        }

        let call = OpenChannelCall {
            channel_id: request.channel_id,
            player: self.address,
            counterparty: terms.counterparty_address,
            player_deposit: deposit,
            counterparty_deposit: terms.counterparty_deposit,
            opening_block: terms.opening_block,
            game_data: request.game_data.clone(),
            verifier_key: terms.verifier_key.clone(),
            signature,
        };
        let options = self.config.tx_options(self.address, self.config.gas_limit_open);
        let receipt = self
            .ledger
            .open_channel(call, options)
            .await?
            .confirmed(self.config.tx_confirmations, |hash| self.emit_tx_hash(hash))
            .await?;
        info!(channel = %request.channel_id, tx = %receipt.hash, "open transaction confirmed");

        let check = peer
            .bus
            .request(
                Action::CheckOpenChannel,
                peer.info.counterparty,
                &CheckOpenChannelRequest {
                    channel_id: request.channel_id,
                },
                true,
            )
            .await?;
        let answer: StatusResponse = check.reply()?;
        if !answer.is_ok() {
            return Err(ChannelError::CounterpartyProtocol(format!(
                "counterparty did not confirm the open channel: {}",
                answer.status
            )));
        }

        Ok(ChannelDescriptor {
            channel_id: request.channel_id,
            counterparty: terms.counterparty_address,
            player_deposit: deposit,
            counterparty_deposit: terms.counterparty_deposit,
            opening_block: terms.opening_block,
            game_data: request.game_data,
            verifier_key: terms.verifier_key,
            total_bet: 0,
        })
    }

    fn emit_tx_hash(&self, hash: &TxHash) {
        self.status.emit(
            StatusTopic::ConnectInfo,
            "transactionHash",
            json!({ "transaction_hash": hash }),
        );
    }

    /// Play one round; signature failures escalate to an on-chain dispute
    pub async fn play_round(&mut self, input: RoundInput) -> Result<RoundReport, ChannelError> {
        self.require(Lifecycle::Open)?;
        let peer = self
            .peer
            .as_mut()
            .ok_or_else(|| ChannelError::InvalidState("not connected".into()))?;
        let counterparty = peer.info.counterparty;
        let channel = peer
            .info
            .channel
            .as_mut()
            .ok_or_else(|| ChannelError::InvalidState("no channel opened".into()))?;

        let ctx = RoundContext {
            bus: &peer.bus,
            crypto: &self.crypto,
            store: &self.store,
            status: &self.status,
            channel,
            counterparty,
        };
        match self.gameplay.play_round(ctx, input).await {
            Ok(report) => Ok(report),
            Err(RoundError::Failed(e)) => Err(e),
            Err(RoundError::Dispute { request, reason }) => {
                match self.open_dispute(&request).await {
                    Ok(receipt) => {
                        warn!(session = request.session, tx = %receipt.hash, "dispute opened")
                    }
                    Err(e) => error!(session = request.session, error = %e, "failed to open dispute"),
                }
                Err(ChannelError::CounterpartyProtocol(reason))
            }
        }
    }

    /// Close the channel with the latest co-signed balances
    pub async fn close_by_consent(&mut self) -> Result<TxReceipt, ChannelError> {
        self.require(Lifecycle::Open)?;
        self.lifecycle = Lifecycle::Closing;

        match self.close_inner().await {
            Ok(receipt) => {
                self.gameplay.reset();
                self.store.clear();
                if let Some(peer) = self.peer.as_mut() {
                    peer.info.channel = None;
                }
                self.lifecycle = Lifecycle::Closed;
                self.status.emit(
                    StatusTopic::ConnectInfo,
                    "channelClosed",
                    json!({ "transaction_hash": receipt.hash }),
                );
                Ok(receipt)
            }
            Err(e) => {
                error!(error = %e, "close by consent failed");
                self.lifecycle = Lifecycle::Open;
                Err(e)
            }
        }
    }

    async fn close_inner(&self) -> Result<TxReceipt, ChannelError> {
        let peer = self.peer()?;
        let channel = self.open_descriptor()?;
        let state = self
            .store
            .get()
            .unwrap_or_else(|| channel.opening_state());

        let close_hash = state.close_hash();
        let signature = self.crypto.sign_hash(close_hash).await?;
        let reply = peer
            .bus
            .request(
                Action::CloseByConsent,
                peer.info.counterparty,
                &CloseRequest {
                    state: state.clone(),
                    is_final: true,
                    signature,
                },
                true,
            )
            .await?;
        let CloseResponse {
            signature: counterparty_signature,
        } = reply.reply()?;

        let signed = self
            .crypto
            .verify_signature(close_hash, counterparty_signature, peer.info.counterparty)
            .await
            .unwrap_or(false);
        if !signed {
            error!(channel = %state.channel_id, "invalid close signature");
            return Err(ChannelError::CounterpartyProtocol(
                "invalid close signature".into(),
            ));
        }

        let call = CloseChannelCall {
            channel_id: state.channel_id,
            player_balance: state.player_balance,
            counterparty_balance: state.counterparty_balance,
            total_bet: state.total_bet,
            session: state.session,
            is_final: true,
            signature: counterparty_signature,
        };
        let options = self.config.tx_options(self.address, self.config.gas_limit_close);
        let receipt = self
            .ledger
            .close_by_consent(call, options)
            .await?
            .confirmed(self.config.tx_confirmations, |hash| self.emit_tx_hash(hash))
            .await?;
        info!(channel = %state.channel_id, tx = %receipt.hash, "close transaction confirmed");

        self.notify(Action::ChannelClosed, &json!({ "channel_id": state.channel_id }))
            .await;
        Ok(receipt)
    }

    /// Best-effort notice to the counterparty, bounded by the handshake timeout
    async fn notify(&self, action: Action, payload: &serde_json::Value) {
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        let request = peer
            .bus
            .request(action, peer.info.counterparty, payload, true);
        match timeout(self.config.handshake_timeout(), request).await {
            Ok(Ok(_)) => debug!(action = %action, "counterparty notified"),
            Ok(Err(e)) => warn!(action = %action, error = %e, "notice failed"),
            Err(_) => warn!(action = %action, "notice not answered"),
        }
    }

    /// Push the latest co-signed state to the ledger if it is behind
    pub async fn update_channel(&mut self) -> Result<UpdateOutcome, ChannelError> {
        let channel_id = self.open_descriptor()?.channel_id;
        let Some(state) = self.store.get() else {
            return Ok(UpdateOutcome::NothingToUpdate);
        };

        let on_chain = self.ledger.read_channel(&channel_id).await?;
        if !on_chain.is_open {
            return Ok(UpdateOutcome::ChannelNotOpen);
        }
        let matches = on_chain.session == state.session
            && on_chain.player_balance == state.player_balance
            && on_chain.counterparty_balance == state.counterparty_balance
            && on_chain.total_bet == state.total_bet;
        if matches {
            debug!(channel = %channel_id, session = state.session, "ledger already current");
            return Ok(UpdateOutcome::AlreadyCurrent);
        }
        if on_chain.session > state.session {
            warn!(
                channel = %channel_id,
                on_chain = on_chain.session,
                local = state.session,
                "ledger is ahead of local state"
            );
            return Ok(UpdateOutcome::LedgerAhead {
                on_chain: on_chain.session,
                local: state.session,
            });
        }

        let signature = state
            .counterparty_signature
            .ok_or_else(|| ChannelError::Validation("stored state is unsigned".into()))?;
        let call = UpdateChannelCall {
            channel_id,
            player_balance: state.player_balance,
            counterparty_balance: state.counterparty_balance,
            total_bet: state.total_bet,
            session: state.session,
            signature,
        };
        let options = self.config.tx_options(self.address, self.config.gas_limit_update);
        let receipt = self
            .ledger
            .update_channel(call, options)
            .await?
            .confirmed(self.config.tx_confirmations, |hash| self.emit_tx_hash(hash))
            .await?;
        info!(channel = %channel_id, session = state.session, tx = %receipt.hash, "channel updated");
        Ok(UpdateOutcome::Submitted(receipt))
    }

    /// Bring the ledger up to date, then dispute `round` on-chain
    pub async fn open_dispute(&mut self, round: &RoundRequest) -> Result<TxReceipt, ChannelError> {
        self.open_descriptor()?;
        let update = self.update_channel().await?;
        debug!(?update, "pre-dispute update");

        let signature = self.crypto.sign_hash(round.round_hash()).await?;
        let call = DisputeCall {
            channel_id: round.channel_id,
            session: round.session,
            wager: round.wager,
            payload: round.payload.clone(),
            seed: round.seed,
            signature,
        };
        let options = self.config.tx_options(self.address, self.config.gas_limit_dispute);
        let receipt = self
            .ledger
            .open_dispute(call, options)
            .await?
            .confirmed(self.config.tx_confirmations, |hash| self.emit_tx_hash(hash))
            .await?;

        self.lifecycle = Lifecycle::Disputed;
        self.status.emit(
            StatusTopic::Error,
            "openDispute",
            json!({ "session": round.session, "transaction_hash": receipt.hash }),
        );
        Ok(receipt)
    }

    /// Close an open channel, say goodbye and leave the private room
    pub async fn disconnect(&mut self) -> Result<(), ChannelError> {
        if self.lifecycle == Lifecycle::Open {
            self.close_by_consent().await?;
        }
        let Some(peer) = self.peer.as_ref() else {
            return Ok(());
        };
        let room = peer.info.room_name.clone();

        self.notify(Action::Disconnect, &json!({})).await;
        if let Some(peer) = self.peer.take() {
            peer.bus.transport().leave().await;
        }
        if self.lifecycle != Lifecycle::Disputed {
            self.lifecycle = Lifecycle::Closed;
        }
        self.status.emit(
            StatusTopic::DisconnectInfo,
            "disconnected",
            json!({ "room": room }),
        );
        info!(room = %room, "disconnected");
        Ok(())
    }
}
