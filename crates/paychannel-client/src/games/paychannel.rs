//! Off-chain balance bookkeeping for one channel.

/// Current split of the channel funds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balances {
    pub player: u128,
    pub counterparty: u128,
}

/// Tracks both deposits and the player's accumulated profit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayChannel {
    player_deposit: u128,
    counterparty_deposit: u128,
    profit: i128,
}

impl PayChannel {
    /// Start a fresh channel with the locked deposits
    pub fn set_deposits(&mut self, player: u128, counterparty: u128) {
        self.player_deposit = player;
        self.counterparty_deposit = counterparty;
        self.profit = 0;
    }

    pub fn add_profit(&mut self, profit: i128) {
        self.profit = self.profit.saturating_add(profit);
    }

    pub fn profit(&self) -> i128 {
        self.profit
    }

    /// Player gets `deposit + profit`, counterparty `deposit - profit`
    ///
    /// Profit is clamped to what the deposits can cover, so the two
    /// balances always sum to the locked total.
    pub fn balances(&self) -> Balances {
        let moved = self.profit.unsigned_abs();
        if self.profit >= 0 {
            let won = moved.min(self.counterparty_deposit);
            Balances {
                player: self.player_deposit.saturating_add(won),
                counterparty: self.counterparty_deposit - won,
            }
        } else {
            let lost = moved.min(self.player_deposit);
            Balances {
                player: self.player_deposit - lost,
                counterparty: self.counterparty_deposit.saturating_add(lost),
            }
        }
    }

    /// Refuse a round the counterparty could not pay out
    pub fn check_round(&self, wager: u128, max_profit: u128) -> Result<(), String> {
        let balances = self.balances();
        if wager > balances.player {
            return Err(format!(
                "wager {} exceeds player balance {}",
                wager, balances.player
            ));
        }
        if max_profit > balances.counterparty {
            return Err(format!(
                "potential payout {} exceeds counterparty balance {}",
                max_profit, balances.counterparty
            ));
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profit_moves_funds_between_parties() {
        let mut channel = PayChannel::default();
        channel.set_deposits(100, 200);

        channel.add_profit(30);
        channel.add_profit(-10);

        assert_eq!(
            channel.balances(),
            Balances {
                player: 120,
                counterparty: 180
            }
        );
    }

    #[test]
    fn test_set_deposits_clears_profit() {
        let mut channel = PayChannel::default();
        channel.set_deposits(100, 200);
        channel.add_profit(50);

        channel.set_deposits(10, 20);

        assert_eq!(channel.profit(), 0);
        assert_eq!(channel.balances().player, 10);
    }

    #[test]
    fn test_balances_never_underflow() {
        let mut channel = PayChannel::default();
        channel.set_deposits(100, 200);
        channel.add_profit(-150);
        assert_eq!(channel.balances().player, 0);
        assert_eq!(channel.balances().counterparty, 300);
    }

    #[test]
    fn test_large_win_keeps_total_locked() {
        let mut channel = PayChannel::default();
        channel.set_deposits(1_000, 2_000);

        channel.add_profit(6_553_500);

        let balances = channel.balances();
        assert_eq!(balances.player, 3_000);
        assert_eq!(balances.counterparty, 0);
        assert_eq!(balances.player + balances.counterparty, 3_000);
    }

    #[test]
    fn test_check_round() {
        let mut channel = PayChannel::default();
        channel.set_deposits(1_000, 2_000);

        assert!(channel.check_round(100, 100).is_ok());
        assert!(channel.check_round(100, 2_000).is_ok());
        assert!(channel.check_round(1_001, 0).is_err());
        assert!(channel.check_round(100, 6_553_500).is_err());

        channel.add_profit(1_500);
        assert!(channel.check_round(100, 600).is_err());
    }

    #[test]
    fn test_reset() {
        let mut channel = PayChannel::default();
        channel.set_deposits(1, 2);
        channel.reset();
        assert_eq!(channel, PayChannel::default());
    }
}
