//! Paychannel Demo
//!
//! Opens a dice channel against an in-process bankroller, plays a few
//! rounds and closes by consent.
//!
//! By default everything runs against a mock ledger. Set
//! `PAYCHANNEL_LEDGER_URL`, `PAYCHANNEL_CONTRACT`, `PAYCHANNEL_PLAYER_KEY`
//! and `PAYCHANNEL_BANKROLLER_KEY` to use a JSON-RPC ledger node instead.

use paychannel_client::{
    BankrollerBehavior, ChannelConfig, ChannelController, ConnectTarget, DiceGame, MemoryNetwork,
    MockBankroller, RoundInput,
};
use paychannel_core::{Address, Identity, LedgerClient, MockLedger, RpcLedgerClient};
use std::error::Error;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ETHER: u128 = 1_000_000_000_000_000_000;

type DemoResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

// ============================================================================
// Setup
// ============================================================================

struct Participants {
    ledger: Arc<dyn LedgerClient>,
    player: Identity,
    bankroller: Identity,
}

fn identity_from_env(key: &str) -> DemoResult<Identity> {
    let hex_key = std::env::var(key).map_err(|_| format!("{} is not set", key))?;
    let bytes: [u8; 32] = hex::decode(hex_key.trim_start_matches("0x"))?
        .try_into()
        .map_err(|_| format!("{} must be 32 bytes", key))?;
    Ok(Identity::from_secret_bytes(&bytes)?)
}

fn participants(config: &ChannelConfig) -> DemoResult<Participants> {
    if let Ok(url) = std::env::var("PAYCHANNEL_LEDGER_URL") {
        let contract: Address = std::env::var("PAYCHANNEL_CONTRACT")
            .map_err(|_| "PAYCHANNEL_CONTRACT is not set")?
            .parse()?;
        info!("Using ledger node at {}", url);
        return Ok(Participants {
            ledger: Arc::new(RpcLedgerClient::new(url, contract)),
            player: identity_from_env("PAYCHANNEL_PLAYER_KEY")?,
            bankroller: identity_from_env("PAYCHANNEL_BANKROLLER_KEY")?,
        });
    }

    info!("Ledger not configured (set PAYCHANNEL_LEDGER_URL to use a node), using mock ledger");
    let ledger = MockLedger::new(config.tx_confirmations + 1);
    let player = Identity::generate();
    let bankroller = Identity::generate();
    ledger.fund(player.address(), ETHER, 100 * ETHER);
    ledger.fund(bankroller.address(), ETHER, 1_000 * ETHER);
    Ok(Participants {
        ledger: Arc::new(ledger),
        player,
        bankroller,
    })
}

// ============================================================================
// Session
// ============================================================================

async fn run() -> DemoResult<()> {
    let config = ChannelConfig::from_env();
    config.validate()?;
    let rounds: u64 = std::env::var("PAYCHANNEL_DEMO_ROUNDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let deposit = ETHER;
    let wager = ETHER / 10;

    let Participants {
        ledger,
        player,
        bankroller,
    } = participants(&config)?;
    let network = Arc::new(MemoryNetwork::new());

    let _bankroller = MockBankroller::new(
        &config,
        bankroller,
        100 * ETHER,
        ledger.clone(),
        network.clone(),
    )?
    .with_behavior(BankrollerBehavior::default())
    .spawn()
    .await?;

    let mut controller =
        ChannelController::new(config, player, ledger, network, Box::new(DiceGame))?;
    let mut events = controller.subscribe_status();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(topic = %event.topic, data = %event.data, "{}", event.status);
        }
    });

    let connection = controller.connect(ConnectTarget::Auto, deposit).await?;
    info!("Connected to bankroller {}", connection.counterparty);

    let channel = controller.open_channel(deposit).await?;
    info!(
        "Channel {} open: player {} / bankroller {}",
        channel.channel_id, channel.player_deposit, channel.counterparty_deposit
    );

    for _ in 0..rounds {
        match controller
            .play_round(RoundInput::new(wager, vec![32_768]))
            .await
        {
            Ok(report) => info!(
                "Round {}: roll {:?} profit {} balance {}",
                report.session,
                report.local_outcome.detail.get(1),
                report.local_outcome.profit,
                report.state.player_balance
            ),
            Err(e) => {
                warn!("Round failed: {}", e);
                break;
            }
        }
    }

    let receipt = controller.close_by_consent().await?;
    info!("Channel closed in {}", receipt.hash);
    controller.disconnect().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("Demo failed: {}", e);
        std::process::exit(1);
    }
}
