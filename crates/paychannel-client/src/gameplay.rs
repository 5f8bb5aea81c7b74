//! Per-round signed exchange with the counterparty.

use crate::bus::RequestBus;
use crate::crypto_worker::CryptoWorker;
use crate::error::ChannelError;
use crate::events::{StatusHub, StatusTopic};
use crate::games::{GameLogic, PayChannel};
use crate::protocol::messages::{CallRequest, CallResponse, UpdateStateRequest};
use crate::protocol::{
    Action, ChannelDescriptor, ChannelState, Envelope, RoundInput, RoundReport, RoundRequest,
};
use crate::store::StateStore;
use paychannel_core::{Address, CryptoError, Hash32, Seed};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Everything a round needs from the channel that owns it
pub struct RoundContext<'a> {
    pub bus: &'a RequestBus,
    pub crypto: &'a CryptoWorker,
    pub store: &'a StateStore,
    pub status: &'a StatusHub,
    pub channel: &'a mut ChannelDescriptor,
    pub counterparty: Address,
}

/// Why a round did not complete
#[derive(Debug)]
pub enum RoundError {
    /// The round failed without evidence of counterparty misbehavior
    Failed(ChannelError),
    /// The counterparty's signatures did not check out; the round must be
    /// disputed on-chain
    Dispute {
        request: RoundRequest,
        reason: String,
    },
}

impl From<ChannelError> for RoundError {
    fn from(err: ChannelError) -> Self {
        RoundError::Failed(err)
    }
}

impl From<CryptoError> for RoundError {
    fn from(err: CryptoError) -> Self {
        RoundError::Failed(err.into())
    }
}

/// Plays rounds one at a time and keeps the channel's balance sheet
pub struct GameplaySession {
    session: u64,
    logic: Box<dyn GameLogic>,
    paychannel: PayChannel,
}

impl GameplaySession {
    pub fn new(logic: Box<dyn GameLogic>) -> Self {
        Self {
            session: 0,
            logic,
            paychannel: PayChannel::default(),
        }
    }

    /// Session number of the most recently started round
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn paychannel(&self) -> &PayChannel {
        &self.paychannel
    }

    pub fn logic(&self) -> &dyn GameLogic {
        self.logic.as_ref()
    }

    /// Begin a freshly opened channel
    pub fn start(&mut self, player_deposit: u128, counterparty_deposit: u128) {
        self.session = 0;
        self.paychannel.set_deposits(player_deposit, counterparty_deposit);
    }

    pub fn reset(&mut self) {
        self.session = 0;
        self.paychannel.reset();
    }

    /// Play one round
    ///
    /// The session counter and the channel's total bet advance as soon as
    /// the round is initiated, even if it later fails.
    pub async fn play_round(
        &mut self,
        ctx: RoundContext<'_>,
        input: RoundInput,
    ) -> Result<RoundReport, RoundError> {
        self.logic.validate(&input).map_err(ChannelError::Validation)?;
        self.paychannel
            .check_round(input.wager, self.logic.max_profit(&input))
            .map_err(ChannelError::Validation)?;

        self.session += 1;
        ctx.channel.total_bet = ctx.channel.total_bet.saturating_add(input.wager);

        let request = RoundRequest {
            channel_id: ctx.channel.channel_id,
            session: self.session,
            wager: input.wager,
            payload: input.payload.clone(),
            seed: Seed::random(),
        };
        let round_hash = request.round_hash();
        let signature = ctx.crypto.sign_hash(round_hash).await?;
        debug!(channel = %request.channel_id, session = request.session, wager = %request.wager, "sending round");

        let reply = ctx
            .bus
            .request(
                Action::Call,
                ctx.counterparty,
                &CallRequest {
                    round: request.clone(),
                    signature,
                },
                true,
            )
            .await?;
        let response: CallResponse = reply.decode()?;

        if let Some(error) = response.error {
            warn!(session = request.session, error = %error, "counterparty refused round");
            ctx.status
                .emit(StatusTopic::GameError, "error", json!({ "msg": error }));
            return Err(ChannelError::CounterpartyProtocol(error).into());
        }
        let result = response.result.ok_or_else(|| {
            ChannelError::Malformed("call response carries neither error nor result".into())
        })?;

        let randomness_valid = check(
            ctx.crypto
                .verify_with_loaded_key(round_hash, result.randomness_signature.clone())
                .await,
        )?;
        if !randomness_valid {
            return Err(dispute(request, "invalid randomness signature"));
        }

        let expected_randomness = Hash32::from_bytes(Sha256::digest(&result.randomness_signature).into());
        if result.args.randomness != expected_randomness
            || result.args.wager != request.wager
            || result.args.payload != request.payload
        {
            return Err(dispute(request, "round arguments not bound to the signed round"));
        }

        let local_outcome = self.logic.compute_outcome(&result.args);
        let mut paychannel = self.paychannel.clone();
        paychannel.add_profit(local_outcome.profit);
        let balances = paychannel.balances();

        let state = ChannelState {
            channel_id: request.channel_id,
            player_balance: balances.player,
            counterparty_balance: balances.counterparty,
            total_bet: ctx.channel.total_bet,
            session: self.session,
            counterparty_signature: Some(result.state_signature),
        };
        let state_hash = state.state_hash();
        let state_valid = check(
            ctx.crypto
                .verify_signature(state_hash, result.state_signature, ctx.counterparty)
                .await,
        )?;
        if !state_valid {
            return Err(dispute(request, "invalid state signature"));
        }

        ctx.store.set(&state)?;
        self.paychannel = paychannel;

        let own_signature = ctx.crypto.sign_hash(state_hash).await?;
        let ack = Envelope::request(
            Action::UpdateState,
            ctx.bus.local_address(),
            ctx.counterparty,
            serde_json::to_value(UpdateStateRequest {
                state: state.clone(),
                signature: own_signature,
            })
            .map_err(ChannelError::from)?,
        );
        let acknowledged = match ctx.bus.send(ack, true).await {
            Ok(_) => true,
            Err(e) => {
                warn!(session = state.session, error = %e, "state acknowledgement not delivered");
                false
            }
        };

        info!(
            channel = %state.channel_id,
            session = state.session,
            profit = %local_outcome.profit,
            player_balance = %state.player_balance,
            "round complete"
        );
        Ok(RoundReport {
            session: state.session,
            counterparty_args: result.args,
            counterparty_outcome: result.outcome,
            local_outcome,
            state,
            acknowledged,
        })
    }
}

/// A bad or malformed counterparty signature reads as `false`; anything
/// else is a local failure
fn check(result: Result<bool, CryptoError>) -> Result<bool, RoundError> {
    match result {
        Ok(valid) => Ok(valid),
        Err(CryptoError::MalformedSignature(reason)) => {
            debug!(reason = %reason, "malformed counterparty signature");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn dispute(request: RoundRequest, reason: &str) -> RoundError {
    warn!(channel = %request.channel_id, session = request.session, reason, "round requires dispute");
    RoundError::Dispute {
        request,
        reason: reason.to_string(),
    }
}
