//! Payloads of each protocol action.

use super::types::{ChannelState, RoundArgs, RoundRequest};
use crate::games::GameOutcome;
use paychannel_core::amount::as_decimal;
use paychannel_core::crypto::{hex_vec, keccak_packed, Token};
use paychannel_core::{Address, ChannelId, Hash32, Signature, VerifierKey};
use serde::{Deserialize, Serialize};

/// `bankroller_active` broadcast: a counterparty is available
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// Largest deposit the counterparty is willing to lock
    #[serde(with = "as_decimal")]
    pub deposit: u128,
}

/// `connect` request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub slug: String,
    pub player: Address,
}

/// `connect` response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub connection_id: String,
}

/// `open_channel` request: the player's half of the open terms
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub channel_id: ChannelId,
    pub player_address: Address,
    #[serde(with = "as_decimal")]
    pub player_deposit: u128,
    pub game_data: Vec<u64>,
}

/// The counterparty's half of the open terms
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelTerms {
    pub counterparty_address: Address,
    #[serde(with = "as_decimal")]
    pub counterparty_deposit: u128,
    pub opening_block: u64,
    pub verifier_key: VerifierKey,
}

/// `open_channel` response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub terms: OpenChannelTerms,
    /// Counterparty's signature over [`OpenChannelRequest::terms_hash`]
    pub signature: Signature,
}

impl OpenChannelRequest {
    /// keccak(channelId, player, counterparty, playerDeposit,
    /// counterpartyDeposit, openingBlock, gameData, modulus, exponent)
    pub fn terms_hash(&self, terms: &OpenChannelTerms) -> Hash32 {
        keccak_packed(&[
            Token::Bytes32(self.channel_id.as_bytes()),
            Token::Address(&self.player_address),
            Token::Address(&terms.counterparty_address),
            Token::Uint(self.player_deposit),
            Token::Uint(terms.counterparty_deposit),
            Token::Uint(u128::from(terms.opening_block)),
            Token::UintArray(&self.game_data),
            Token::Bytes(&terms.verifier_key.modulus),
            Token::Bytes(&terms.verifier_key.exponent),
        ])
    }
}

/// Generic acknowledgement (`check_open_channel`, `update_state`,
/// `channel_closed`, `disconnect`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// `check_open_channel` request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckOpenChannelRequest {
    pub channel_id: ChannelId,
}

/// `call` request: one signed round
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallRequest {
    pub round: RoundRequest,
    /// Player's signature over [`RoundRequest::round_hash`]
    pub signature: Signature,
}

/// `call` response
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CallResponse {
    /// Set when the counterparty refused to play the round
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<CallResult>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallResult {
    /// RSA signature over the round hash with the published verifier key
    #[serde(with = "hex_vec")]
    pub randomness_signature: Vec<u8>,
    pub args: RoundArgs,
    pub outcome: GameOutcome,
    /// Counterparty's signature over the resulting state hash
    pub state_signature: Signature,
}

/// `update_state` request: the player's countersignature of a round state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateStateRequest {
    pub state: ChannelState,
    pub signature: Signature,
}

/// `close_by_consent` request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseRequest {
    pub state: ChannelState,
    pub is_final: bool,
    /// Player's signature over [`ChannelState::close_hash`]
    pub signature: Signature,
}

/// `close_by_consent` response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseResponse {
    pub signature: Signature,
}
