//! In-process bankroller speaking the channel protocol.
//!
//! Announces its capacity in the shared room, accepts connections into
//! private rooms and answers every channel request. Knobs in
//! [`BankrollerBehavior`] make it misbehave in specific ways.

use crate::bus::RequestBus;
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::games::{DiceGame, GameLogic, PayChannel};
use crate::protocol::messages::{
    Availability, CallRequest, CallResponse, CallResult, CheckOpenChannelRequest, CloseRequest,
    CloseResponse, ConnectRequest, ConnectResponse, OpenChannelRequest, OpenChannelResponse,
    OpenChannelTerms, StatusResponse, UpdateStateRequest,
};
use crate::protocol::{Action, ChannelState, Envelope, MessageKind, RoundArgs, RoundInput};
use crate::transport::{RoomOptions, Transport, TransportFactory};
use paychannel_core::crypto::verify_signer;
use paychannel_core::ledger::LedgerClient;
use paychannel_core::{Address, CryptoError, Hash32, Identity, Signature, VerifierKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RSA_BITS: usize = 1024;
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(50);

static RSA_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

/// Process-wide RSA key used for randomness signatures
///
/// Generated once on first use.
pub fn shared_rsa_key() -> Result<RsaPrivateKey, ChannelError> {
    if let Some(key) = RSA_KEY.get() {
        return Ok(key.clone());
    }
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(RSA_KEY.get_or_init(|| key).clone())
}

fn verifier_key(key: &RsaPrivateKey) -> VerifierKey {
    VerifierKey {
        modulus: key.n().to_bytes_be(),
        exponent: key.e().to_bytes_be(),
    }
}

/// Ways the bankroller can deviate from the protocol
#[derive(Clone, Debug, Default)]
pub struct BankrollerBehavior {
    /// Offer half of the required counterparty deposit
    pub short_deposit: bool,
    /// Sign the open terms with an unrelated key
    pub bad_open_signature: bool,
    /// Corrupt the randomness signature after deriving the randomness
    pub tamper_randomness: bool,
    /// Sign the state of this session with an unrelated key
    pub bad_state_signature_at: Option<u64>,
    /// Sign the close hash with an unrelated key
    pub bad_close_signature: bool,
    /// Never answer connect requests
    pub silent_handshake: bool,
    /// Refuse every round with this message
    pub round_error: Option<String>,
}

/// Counters observable from tests
#[derive(Debug, Default)]
pub struct BankrollerStats {
    connections: AtomicU64,
    rounds: AtomicU64,
    acks: AtomicU64,
    closes: AtomicU64,
}

impl BankrollerStats {
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::SeqCst)
    }

    /// State acknowledgements with a valid player signature
    pub fn acks(&self) -> u64 {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

struct Inner {
    config: ChannelConfig,
    identity: Identity,
    address: Address,
    deposit_capacity: u128,
    ledger: Arc<dyn LedgerClient>,
    network: Arc<dyn TransportFactory>,
    behavior: BankrollerBehavior,
    logic: Arc<dyn GameLogic>,
    rsa_key: RsaPrivateKey,
    verifier_key: VerifierKey,
    stats: Arc<BankrollerStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn signer(&self, honest: bool) -> Identity {
        if honest {
            self.identity.clone()
        } else {
            Identity::generate()
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// Scripted counterparty for tests and demos
pub struct MockBankroller {
    inner: Inner,
    announce_interval: Duration,
}

impl MockBankroller {
    pub fn new(
        config: &ChannelConfig,
        identity: Identity,
        deposit_capacity: u128,
        ledger: Arc<dyn LedgerClient>,
        network: Arc<dyn TransportFactory>,
    ) -> Result<Self, ChannelError> {
        let rsa_key = shared_rsa_key()?;
        Ok(Self {
            inner: Inner {
                config: config.clone(),
                address: identity.address(),
                identity,
                deposit_capacity,
                ledger,
                network,
                behavior: BankrollerBehavior::default(),
                logic: Arc::new(DiceGame),
                verifier_key: verifier_key(&rsa_key),
                rsa_key,
                stats: Arc::new(BankrollerStats::default()),
                tasks: Mutex::new(Vec::new()),
            },
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
        })
    }

    pub fn with_behavior(mut self, behavior: BankrollerBehavior) -> Self {
        self.inner.behavior = behavior;
        self
    }

    pub fn with_logic(mut self, logic: Arc<dyn GameLogic>) -> Self {
        self.inner.logic = logic;
        self
    }

    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    /// Join the shared room and start serving
    pub async fn spawn(self) -> Result<BankrollerHandle, ChannelError> {
        let inner = Arc::new(self.inner);
        let room = inner
            .network
            .join(
                inner.address,
                &inner.config.shared_room_name(),
                RoomOptions::default(),
            )
            .await?;
        let bus = RequestBus::new(room.clone(), inner.address);
        let requests = bus.incoming();

        let lobby = tokio::spawn(serve_lobby(
            inner.clone(),
            room,
            bus,
            requests,
            self.announce_interval,
        ));
        info!(address = %inner.address, capacity = %inner.deposit_capacity, "bankroller started");

        Ok(BankrollerHandle {
            address: inner.address,
            stats: inner.stats.clone(),
            lobby,
            inner,
        })
    }
}

/// Running bankroller; stops serving when dropped
pub struct BankrollerHandle {
    address: Address,
    stats: Arc<BankrollerStats>,
    lobby: JoinHandle<()>,
    inner: Arc<Inner>,
}

impl BankrollerHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn stats(&self) -> &BankrollerStats {
        &self.stats
    }
}

impl Drop for BankrollerHandle {
    fn drop(&mut self) {
        self.lobby.abort();
        let tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for task in tasks.iter() {
            task.abort();
        }
    }
}

/// Announce capacity and accept connections in the shared room
async fn serve_lobby(
    inner: Arc<Inner>,
    room: Arc<dyn Transport>,
    bus: RequestBus,
    mut requests: broadcast::Receiver<Envelope>,
    announce_interval: Duration,
) {
    let mut announce = tokio::time::interval(announce_interval);
    let availability = match serde_json::to_value(Availability {
        deposit: inner.deposit_capacity,
    }) {
        Ok(availability) => availability,
        Err(e) => {
            warn!(error = %e, "cannot encode availability");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = announce.tick() => {
                room.send_fire_and_forget(Envelope::broadcast(
                    Action::BankrollerActive,
                    inner.address,
                    availability.clone(),
                ));
            }
            message = requests.recv() => {
                match message {
                    Ok(envelope) if envelope.is_request(Action::Connect) => {
                        if inner.behavior.silent_handshake {
                            debug!(sender = %envelope.sender, "ignoring connect request");
                            continue;
                        }
                        let reply = match accept(&inner, &envelope).await {
                            Ok(response) => serde_json::to_value(response).map_err(ChannelError::from),
                            Err(e) => Err(e),
                        };
                        respond(&bus, &envelope, reply).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "lobby lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Open a private room for the requesting player
async fn accept(inner: &Arc<Inner>, envelope: &Envelope) -> Result<ConnectResponse, ChannelError> {
    let request: ConnectRequest = envelope.decode()?;
    if request.slug != inner.config.app_slug {
        return Err(ChannelError::Validation(format!(
            "unknown application {}",
            request.slug
        )));
    }
    if request.player != envelope.sender {
        return Err(ChannelError::Validation("player does not match sender".into()));
    }

    let connection_id = Uuid::new_v4().to_string();
    let room_name = inner.config.private_room_name(&connection_id);
    let room = inner
        .network
        .join(
            inner.address,
            &room_name,
            RoomOptions::private(inner.identity.export_secret(), request.player),
        )
        .await?;
    let bus = RequestBus::new(room, inner.address);
    let requests = bus.incoming();

    inner.track(tokio::spawn(serve_player(
        inner.clone(),
        bus,
        requests,
        request.player,
    )));
    inner.stats.connections.fetch_add(1, Ordering::SeqCst);
    info!(player = %request.player, room = %room_name, "player connected");
    Ok(ConnectResponse { connection_id })
}

async fn respond(bus: &RequestBus, request: &Envelope, reply: Result<Value, ChannelError>) {
    let payload = match reply {
        Ok(payload) => payload,
        Err(e) => {
            warn!(action = %request.action, error = %e, "refusing request");
            json!({ "error": e.to_string() })
        }
    };
    if let Err(e) = bus.respond(request, &payload).await {
        warn!(action = %request.action, error = %e, "failed to respond");
    }
}

/// Channel bookkeeping for one connected player
struct PlayerChannel {
    request: OpenChannelRequest,
    terms: OpenChannelTerms,
    active: bool,
    session: u64,
    total_bet: u128,
    paychannel: PayChannel,
}

impl PlayerChannel {
    fn state(&self) -> ChannelState {
        let balances = self.paychannel.balances();
        ChannelState {
            channel_id: self.request.channel_id,
            player_balance: balances.player,
            counterparty_balance: balances.counterparty,
            total_bet: self.total_bet,
            session: self.session,
            counterparty_signature: None,
        }
    }
}

struct PlayerSession {
    inner: Arc<Inner>,
    player: Address,
    channel: Option<PlayerChannel>,
}

async fn serve_player(
    inner: Arc<Inner>,
    bus: RequestBus,
    mut requests: broadcast::Receiver<Envelope>,
    player: Address,
) {
    let mut session = PlayerSession {
        inner,
        player,
        channel: None,
    };

    loop {
        let envelope = match requests.recv().await {
            Ok(envelope) => envelope,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "player session lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if envelope.kind != MessageKind::Request {
            continue;
        }

        let reply = session.handle(&envelope).await;
        respond(&bus, &envelope, reply).await;
        if envelope.action == Action::Disconnect {
            break;
        }
    }

    bus.transport().leave().await;
    debug!(player = %player, "player session ended");
}

impl PlayerSession {
    async fn handle(&mut self, envelope: &Envelope) -> Result<Value, ChannelError> {
        match envelope.action {
            Action::OpenChannel => {
                let response = self.open_channel(envelope.decode()?).await?;
                Ok(serde_json::to_value(response)?)
            }
            Action::CheckOpenChannel => {
                let response = self.check_open_channel(envelope.decode()?).await?;
                Ok(serde_json::to_value(response)?)
            }
            Action::Call => {
                let response = self.call(envelope.decode()?)?;
                Ok(serde_json::to_value(response)?)
            }
            Action::UpdateState => {
                let response = self.update_state(envelope.decode()?)?;
                Ok(serde_json::to_value(response)?)
            }
            Action::CloseByConsent => {
                let response = self.close(envelope.decode()?)?;
                Ok(serde_json::to_value(response)?)
            }
            Action::ChannelClosed => {
                self.channel = None;
                Ok(serde_json::to_value(StatusResponse::ok())?)
            }
            Action::Disconnect => Ok(serde_json::to_value(StatusResponse::ok())?),
            other => Err(ChannelError::Validation(format!("unsupported action {}", other))),
        }
    }

    fn active_channel(&mut self) -> Result<&mut PlayerChannel, ChannelError> {
        self.channel
            .as_mut()
            .filter(|channel| channel.active)
            .ok_or_else(|| ChannelError::InvalidState("no open channel".into()))
    }

    fn player_signed(&self, hash: &Hash32, signature: &Signature) -> Result<(), ChannelError> {
        if verify_signer(hash, signature, &self.player)? {
            Ok(())
        } else {
            Err(ChannelError::Validation("invalid player signature".into()))
        }
    }

    async fn open_channel(
        &mut self,
        request: OpenChannelRequest,
    ) -> Result<OpenChannelResponse, ChannelError> {
        let inner = &self.inner;
        if request.player_address != self.player {
            return Err(ChannelError::Validation("player does not match connection".into()));
        }

        let mut deposit = inner
            .config
            .required_counterparty_deposit(request.player_deposit);
        if inner.behavior.short_deposit {
            deposit /= 2;
        }
        if deposit > inner.deposit_capacity {
            return Err(ChannelError::InsufficientFunds(format!(
                "deposit {} exceeds capacity {}",
                deposit, inner.deposit_capacity
            )));
        }

        let contract = inner.ledger.contract_address();
        let options = inner
            .config
            .tx_options(inner.address, inner.config.gas_limit_open);
        inner
            .ledger
            .approve(&contract, deposit, options)
            .await?
            .confirmed(inner.config.tx_confirmations, |_| {})
            .await?;
        let opening_block = inner.ledger.block_number().await?;

        let terms = OpenChannelTerms {
            counterparty_address: inner.address,
            counterparty_deposit: deposit,
            opening_block,
            verifier_key: inner.verifier_key.clone(),
        };
        let signature = inner
            .signer(!inner.behavior.bad_open_signature)
            .sign_hash(&request.terms_hash(&terms));
        debug!(channel = %request.channel_id, deposit = %deposit, "offering channel terms");

        self.channel = Some(PlayerChannel {
            request,
            terms: terms.clone(),
            active: false,
            session: 0,
            total_bet: 0,
            paychannel: PayChannel::default(),
        });
        Ok(OpenChannelResponse { terms, signature })
    }

    async fn check_open_channel(
        &mut self,
        request: CheckOpenChannelRequest,
    ) -> Result<StatusResponse, ChannelError> {
        let on_chain = self.inner.ledger.read_channel(&request.channel_id).await?;
        let channel = self
            .channel
            .as_mut()
            .filter(|channel| channel.request.channel_id == request.channel_id)
            .ok_or_else(|| ChannelError::InvalidState("unknown channel".into()))?;

        if !on_chain.is_open {
            return Ok(StatusResponse {
                status: "not_open".to_string(),
            });
        }
        channel.active = true;
        channel
            .paychannel
            .set_deposits(channel.request.player_deposit, channel.terms.counterparty_deposit);
        info!(channel = %request.channel_id, "channel open");
        Ok(StatusResponse::ok())
    }

    fn call(&mut self, call: CallRequest) -> Result<CallResponse, ChannelError> {
        let round = call.round;
        let round_hash = round.round_hash();
        self.player_signed(&round_hash, &call.signature)?;

        let inner = self.inner.clone();
        let channel = self.active_channel()?;
        if round.channel_id != channel.request.channel_id {
            return Err(ChannelError::Validation("round for another channel".into()));
        }
        if round.session <= channel.session {
            return Err(ChannelError::Validation(format!(
                "stale session {} after {}",
                round.session, channel.session
            )));
        }
        channel.session = round.session;
        channel.total_bet = channel.total_bet.saturating_add(round.wager);
        inner.stats.rounds.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = &inner.behavior.round_error {
            return Ok(CallResponse {
                error: Some(error.clone()),
                result: None,
            });
        }
        let input = RoundInput::new(round.wager, round.payload.clone());
        inner.logic.validate(&input).map_err(ChannelError::Validation)?;
        channel
            .paychannel
            .check_round(input.wager, inner.logic.max_profit(&input))
            .map_err(ChannelError::Validation)?;

        let mut randomness_signature = inner
            .rsa_key
            .sign(Pkcs1v15Sign::new_unprefixed(), round_hash.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let args = RoundArgs {
            wager: round.wager,
            payload: round.payload.clone(),
            randomness: Hash32::from_bytes(Sha256::digest(&randomness_signature).into()),
        };
        if inner.behavior.tamper_randomness {
            if let Some(last) = randomness_signature.last_mut() {
                *last ^= 0x01;
            }
        }

        let outcome = inner.logic.compute_outcome(&args);
        channel.paychannel.add_profit(outcome.profit);
        let state = channel.state();
        let honest = inner.behavior.bad_state_signature_at != Some(round.session);
        let state_signature = inner.signer(honest).sign_hash(&state.state_hash());
        debug!(
            session = round.session,
            profit = %outcome.profit,
            player_balance = %state.player_balance,
            "round played"
        );

        Ok(CallResponse {
            error: None,
            result: Some(CallResult {
                randomness_signature,
                args,
                outcome,
                state_signature,
            }),
        })
    }

    fn update_state(&mut self, update: UpdateStateRequest) -> Result<StatusResponse, ChannelError> {
        self.player_signed(&update.state.state_hash(), &update.signature)?;
        let stats = self.inner.stats.clone();
        let channel = self.active_channel()?;
        if update.state.session != channel.session {
            return Err(ChannelError::Validation(format!(
                "acknowledged session {} but current is {}",
                update.state.session, channel.session
            )));
        }
        stats.acks.fetch_add(1, Ordering::SeqCst);
        Ok(StatusResponse::ok())
    }

    fn close(&mut self, close: CloseRequest) -> Result<CloseResponse, ChannelError> {
        let close_hash = close.state.close_hash();
        self.player_signed(&close_hash, &close.signature)?;
        if !close.is_final {
            return Err(ChannelError::Validation("close must be final".into()));
        }

        let inner = self.inner.clone();
        let channel = self.active_channel()?;
        let expected = channel.state();
        if close.state.channel_id != expected.channel_id
            || close.state.session != expected.session
            || close.state.player_balance != expected.player_balance
            || close.state.counterparty_balance != expected.counterparty_balance
            || close.state.total_bet != expected.total_bet
        {
            return Err(ChannelError::Validation(
                "close state does not match the channel".into(),
            ));
        }

        let signature = inner
            .signer(!inner.behavior.bad_close_signature)
            .sign_hash(&close_hash);
        inner.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(CloseResponse { signature })
    }
}
