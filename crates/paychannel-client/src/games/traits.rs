//! Game logic trait.

use crate::protocol::{RoundArgs, RoundInput};
use paychannel_core::amount::as_signed_decimal;
use serde::{Deserialize, Serialize};

/// Result of running the game function once
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOutcome {
    /// Player's balance change; negative when the player loses
    #[serde(with = "as_signed_decimal")]
    pub profit: i128,
    /// Game-specific details (e.g. the roll)
    pub detail: Vec<u64>,
}

/// Deterministic game played by both sides of a channel
///
/// Both the player and the counterparty run `compute_outcome` on the same
/// arguments, so it must depend on nothing but them.
pub trait GameLogic: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check a round before it is signed and sent
    fn validate(&self, input: &RoundInput) -> Result<(), String>;

    /// Largest profit the player can make on a valid round
    fn max_profit(&self, input: &RoundInput) -> u128;

    fn compute_outcome(&self, args: &RoundArgs) -> GameOutcome;
}
