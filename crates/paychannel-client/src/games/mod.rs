//! Local game logic and the payment sub-ledger.

mod dice;
mod paychannel;
mod traits;

pub use dice::{DiceGame, DICE_RANGE};
pub use paychannel::{Balances, PayChannel};
pub use traits::{GameLogic, GameOutcome};
