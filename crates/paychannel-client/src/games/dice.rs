//! Dice game: win when the roll falls under the chosen chance.

use super::traits::{GameLogic, GameOutcome};
use crate::protocol::{RoundArgs, RoundInput};

/// Number of possible rolls
pub const DICE_RANGE: u64 = 65_536;

/// `payload[0]` is the winning chance out of [`DICE_RANGE`]
///
/// The roll is the round randomness modulo the range. A winning roll pays
/// `wager * range / chance - wager`, a losing one costs the wager.
pub struct DiceGame;

impl DiceGame {
    pub fn roll(args: &RoundArgs) -> u64 {
        let bytes = args.randomness.as_bytes();
        u64::from(u16::from_be_bytes([bytes[30], bytes[31]]))
    }

    fn chance(payload: &[u64]) -> Option<u64> {
        payload
            .first()
            .copied()
            .filter(|chance| (1..DICE_RANGE).contains(chance))
    }
}

impl GameLogic for DiceGame {
    fn name(&self) -> &'static str {
        "dice"
    }

    fn validate(&self, input: &RoundInput) -> Result<(), String> {
        if input.wager == 0 {
            return Err("wager must be positive".to_string());
        }
        if Self::chance(&input.payload).is_none() {
            return Err(format!("chance must be in 1..{}", DICE_RANGE));
        }
        Ok(())
    }

    fn max_profit(&self, input: &RoundInput) -> u128 {
        match Self::chance(&input.payload) {
            Some(chance) => payout(input.wager, chance).saturating_sub(input.wager),
            None => 0,
        }
    }

    fn compute_outcome(&self, args: &RoundArgs) -> GameOutcome {
        let roll = Self::roll(args);
        let loss = GameOutcome {
            profit: to_signed(args.wager).saturating_neg(),
            detail: vec![args.payload.first().copied().unwrap_or(0), roll],
        };

        let Some(chance) = Self::chance(&args.payload) else {
            return loss;
        };
        if roll >= chance {
            return loss;
        }

        GameOutcome {
            profit: to_signed(payout(args.wager, chance).saturating_sub(args.wager)),
            detail: vec![chance, roll],
        }
    }
}

fn payout(wager: u128, chance: u64) -> u128 {
    wager.saturating_mul(u128::from(DICE_RANGE)) / u128::from(chance)
}

fn to_signed(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}
