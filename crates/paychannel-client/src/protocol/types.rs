//! Channel data model.

use crate::games::GameOutcome;
use paychannel_core::amount::as_decimal;
use paychannel_core::crypto::{keccak_packed, Token};
use paychannel_core::{Address, ChannelId, Hash32, Seed, Signature, VerifierKey};
use serde::{Deserialize, Serialize};

/// Latest co-signed balance split of a channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_id: ChannelId,
    #[serde(with = "as_decimal")]
    pub player_balance: u128,
    #[serde(with = "as_decimal")]
    pub counterparty_balance: u128,
    #[serde(with = "as_decimal")]
    pub total_bet: u128,
    pub session: u64,
    /// Counterparty's signature over [`ChannelState::state_hash`]
    pub counterparty_signature: Option<Signature>,
}

impl ChannelState {
    /// keccak(channelId, playerBalance, counterpartyBalance, totalBet, session)
    pub fn state_hash(&self) -> Hash32 {
        keccak_packed(&self.tokens(None))
    }

    /// State hash extended with the final flag, signed to close by consent
    pub fn close_hash(&self) -> Hash32 {
        keccak_packed(&self.tokens(Some(true)))
    }

    fn tokens(&self, is_final: Option<bool>) -> Vec<Token<'_>> {
        let mut tokens = vec![
            Token::Bytes32(self.channel_id.as_bytes()),
            Token::Uint(self.player_balance),
            Token::Uint(self.counterparty_balance),
            Token::Uint(self.total_bet),
            Token::Uint(u128::from(self.session)),
        ];
        if let Some(flag) = is_final {
            tokens.push(Token::Bool(flag));
        }
        tokens
    }

    /// Names of required fields that are unset
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.channel_id.is_zero() {
            missing.push("channel_id");
        }
        if self.counterparty_signature.is_none() {
            missing.push("counterparty_signature");
        }
        missing
    }
}

/// Parameters of an open channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub channel_id: ChannelId,
    pub counterparty: Address,
    #[serde(with = "as_decimal")]
    pub player_deposit: u128,
    #[serde(with = "as_decimal")]
    pub counterparty_deposit: u128,
    pub opening_block: u64,
    pub game_data: Vec<u64>,
    pub verifier_key: VerifierKey,
    /// Sum of all wagers placed so far
    #[serde(with = "as_decimal")]
    pub total_bet: u128,
}

impl ChannelDescriptor {
    /// State before any round was played
    pub fn opening_state(&self) -> ChannelState {
        ChannelState {
            channel_id: self.channel_id,
            player_balance: self.player_deposit,
            counterparty_balance: self.counterparty_deposit,
            total_bet: 0,
            session: 0,
            counterparty_signature: None,
        }
    }
}

/// Result of a successful handshake
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub counterparty: Address,
    /// Identifier assigned by the counterparty for this connection
    pub connection_id: String,
    pub room_name: String,
    pub channel: Option<ChannelDescriptor>,
}

/// One round as signed by the player
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRequest {
    pub channel_id: ChannelId,
    pub session: u64,
    #[serde(with = "as_decimal")]
    pub wager: u128,
    pub payload: Vec<u64>,
    pub seed: Seed,
}

impl RoundRequest {
    /// keccak(channelId, session, wager, payload, seed)
    pub fn round_hash(&self) -> Hash32 {
        keccak_packed(&[
            Token::Bytes32(self.channel_id.as_bytes()),
            Token::Uint(u128::from(self.session)),
            Token::Uint(self.wager),
            Token::UintArray(&self.payload),
            Token::Bytes32(self.seed.as_bytes()),
        ])
    }
}

/// What the caller wants to play
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInput {
    #[serde(with = "as_decimal")]
    pub wager: u128,
    pub payload: Vec<u64>,
}

impl RoundInput {
    pub fn new(wager: u128, payload: Vec<u64>) -> Self {
        Self { wager, payload }
    }
}

/// Arguments of the game function as supplied by the counterparty
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundArgs {
    #[serde(with = "as_decimal")]
    pub wager: u128,
    pub payload: Vec<u64>,
    /// sha256 of the counterparty's randomness signature
    pub randomness: Hash32,
}

/// Outcome of a completed round
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundReport {
    pub session: u64,
    /// Arguments the counterparty ran the game with
    pub counterparty_args: RoundArgs,
    pub counterparty_outcome: GameOutcome,
    pub local_outcome: GameOutcome,
    /// Newly stored state
    pub state: ChannelState,
    /// Whether the transport delivered our countersignature
    pub acknowledged: bool,
}
