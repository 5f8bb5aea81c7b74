//! Engine configuration.

use crate::error::ChannelError;
use paychannel_core::amount::as_decimal;
use paychannel_core::crypto::keccak256;
use paychannel_core::ledger::TxOptions;
use paychannel_core::{Address, Hash32};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Basis points in one whole ratio
const BPS: u128 = 10_000;

/// Channel engine settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Application slug; its hash scopes the discovery and private rooms
    pub app_slug: String,
    /// Confirmations a transaction needs before it counts as final
    pub tx_confirmations: u64,
    pub handshake_timeout_ms: u64,
    /// Interval of the "still searching" status during discovery
    pub discovery_status_interval_ms: u64,
    /// Minimum counterparty deposit per player deposit, in basis points
    pub deposit_ratio_bps: u32,
    /// Minimum native balance needed to pay for gas
    #[serde(with = "as_decimal")]
    pub min_native_balance: u128,
    /// Base gas price in wei; submissions pay 1.2x this
    pub gas_price: u64,
    pub gas_limit_open: u64,
    pub gas_limit_close: u64,
    pub gas_limit_update: u64,
    pub gas_limit_dispute: u64,
    /// Game parameters committed in the open terms
    pub game_data: Vec<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            app_slug: "dicegame_v2".to_string(),
            tx_confirmations: 2,
            handshake_timeout_ms: 7777,
            discovery_status_interval_ms: 8000,
            deposit_ratio_bps: 20_000,
            min_native_balance: 10_000_000_000_000_000,
            gas_price: 40_000_000_000,
            gas_limit_open: 4_600_000,
            gas_limit_close: 900_000,
            gas_limit_update: 4_600_000,
            gas_limit_dispute: 4_600_000,
            game_data: vec![0],
        }
    }
}

impl ChannelConfig {
    /// Defaults overridden by `PAYCHANNEL_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            app_slug: std::env::var("PAYCHANNEL_APP_SLUG").unwrap_or(defaults.app_slug),
            tx_confirmations: env_or("PAYCHANNEL_TX_CONFIRMATIONS", defaults.tx_confirmations),
            handshake_timeout_ms: env_or(
                "PAYCHANNEL_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout_ms,
            ),
            discovery_status_interval_ms: env_or(
                "PAYCHANNEL_DISCOVERY_STATUS_INTERVAL_MS",
                defaults.discovery_status_interval_ms,
            ),
            deposit_ratio_bps: env_or("PAYCHANNEL_DEPOSIT_RATIO_BPS", defaults.deposit_ratio_bps),
            min_native_balance: env_or(
                "PAYCHANNEL_MIN_NATIVE_BALANCE",
                defaults.min_native_balance,
            ),
            gas_price: env_or("PAYCHANNEL_GAS_PRICE", defaults.gas_price),
            ..defaults
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.app_slug.is_empty() {
            return Err(ChannelError::Validation("app_slug must not be empty".into()));
        }
        if self.tx_confirmations == 0 {
            return Err(ChannelError::Validation(
                "tx_confirmations must be at least 1".into(),
            ));
        }
        if self.deposit_ratio_bps == 0 {
            return Err(ChannelError::Validation(
                "deposit_ratio_bps must be positive".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ChannelError::Validation(
                "handshake_timeout_ms must be positive".into(),
            ));
        }
        if self.discovery_status_interval_ms == 0 {
            return Err(ChannelError::Validation(
                "discovery_status_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Never zero, even for a config that skipped [`validate`](Self::validate)
    pub fn discovery_status_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_status_interval_ms.max(1))
    }

    /// Smallest counterparty deposit acceptable for `player_deposit`
    pub fn required_counterparty_deposit(&self, player_deposit: u128) -> u128 {
        let ratio = u128::from(self.deposit_ratio_bps);
        match player_deposit.checked_mul(ratio) {
            Some(scaled) => scaled / BPS,
            None => (player_deposit / BPS).saturating_mul(ratio),
        }
    }

    /// Gas price actually submitted with transactions
    pub fn submitted_gas_price(&self) -> u64 {
        self.gas_price.saturating_mul(12) / 10
    }

    pub fn tx_options(&self, from: Address, gas_limit: u64) -> TxOptions {
        TxOptions {
            from,
            gas_limit,
            gas_price: self.submitted_gas_price(),
        }
    }

    /// keccak-256 of the application slug
    pub fn app_hash(&self) -> Hash32 {
        keccak256(self.app_slug.as_bytes())
    }

    /// Room every bankroller of this application announces itself in
    pub fn shared_room_name(&self) -> String {
        format!("dapp_room_{}", hex::encode(self.app_hash().as_bytes()))
    }

    /// Room private to one player/bankroller connection
    pub fn private_room_name(&self, connection_id: &str) -> String {
        format!("{}_{}", hex::encode(self.app_hash().as_bytes()), connection_id)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ChannelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.handshake_timeout(), Duration::from_millis(7777));
        assert_eq!(config.submitted_gas_price(), 48_000_000_000);
    }

    #[test]
    fn test_required_counterparty_deposit() {
        let config = ChannelConfig::default();
        assert_eq!(config.required_counterparty_deposit(1_000), 2_000);

        let config = ChannelConfig {
            deposit_ratio_bps: 15_000,
            ..ChannelConfig::default()
        };
        assert_eq!(config.required_counterparty_deposit(1_000), 1_500);
        assert!(config.required_counterparty_deposit(u128::MAX) > u128::MAX / 2);
    }

    #[test]
    fn test_room_names_share_app_hash() {
        let config = ChannelConfig::default();
        let hash = hex::encode(config.app_hash().as_bytes());
        assert_eq!(config.shared_room_name(), format!("dapp_room_{}", hash));
        assert_eq!(config.private_room_name("42"), format!("{}_42", hash));
    }

    #[test]
    fn test_zero_confirmations_rejected() {
        let config = ChannelConfig {
            tx_confirmations: 0,
            ..ChannelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChannelError::Validation(_))));
    }

    #[test]
    fn test_zero_discovery_interval_rejected() {
        let config: ChannelConfig =
            serde_json::from_str(r#"{"discovery_status_interval_ms":0}"#).unwrap();
        assert!(matches!(config.validate(), Err(ChannelError::Validation(_))));
        assert_eq!(config.discovery_status_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ChannelConfig =
            serde_json::from_str(r#"{"app_slug":"coinflip","tx_confirmations":6}"#).unwrap();
        assert_eq!(config.app_slug, "coinflip");
        assert_eq!(config.tx_confirmations, 6);
        assert_eq!(config.gas_limit_close, 900_000);
    }
}
