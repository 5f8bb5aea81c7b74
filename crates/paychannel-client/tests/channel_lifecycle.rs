//! Integration tests for the happy-path channel lifecycle.
//!
//! A player discovers a bankroller, opens a channel on the mock ledger,
//! plays rounds and closes by consent.

mod common;

use common::*;
use paychannel_client::{
    BankrollerBehavior, ChannelError, ConnectTarget, Lifecycle, RoundInput, StatusTopic,
    UpdateOutcome,
};
use paychannel_core::ledger::{LedgerCall, OnChainChannel};
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_full_channel_lifecycle() {
    let harness = Harness::new();
    let bankroller = harness
        .bankroller(BANKROLL, BankrollerBehavior::default())
        .await;
    let mut player = harness.player();
    let mut events = player.subscribe_status();

    // Phase 1: discover and connect
    let info = player
        .connect(ConnectTarget::Auto, PLAYER_DEPOSIT)
        .await
        .unwrap();
    assert_eq!(info.counterparty, bankroller.address());
    assert!(info.room_name.ends_with(&info.connection_id));

    // Phase 2: open the channel
    let channel = player.open_channel(PLAYER_DEPOSIT).await.unwrap();
    assert_eq!(player.lifecycle(), Lifecycle::Open);
    assert_eq!(channel.player_deposit, PLAYER_DEPOSIT);
    assert_eq!(channel.counterparty_deposit, 2 * PLAYER_DEPOSIT);
    assert_eq!(
        harness.ledger.token_balance(&player.address()),
        STARTING_TOKENS - PLAYER_DEPOSIT
    );
    assert!(player.latest_state().is_none());

    // Phase 3: play three rounds
    for session in 1..=3u64 {
        let report = player
            .play_round(RoundInput::new(WAGER, vec![HALF_CHANCE]))
            .await
            .unwrap();
        assert_eq!(report.session, session);
        assert_eq!(report.local_outcome, report.counterparty_outcome);
        assert_eq!(report.state.total_bet, WAGER * u128::from(session));
        assert!(report.acknowledged);
        assert_eq!(player.latest_state().unwrap(), report.state);
    }
    let last = player.latest_state().unwrap();
    assert_eq!(
        last.player_balance + last.counterparty_balance,
        3 * PLAYER_DEPOSIT
    );
    assert_eq!(player.balances().player, last.player_balance);

    // Phase 4: close by consent
    let receipt = player.close_by_consent().await.unwrap();
    assert!(receipt.confirmations >= harness.config.tx_confirmations);
    assert_eq!(player.lifecycle(), Lifecycle::Closed);
    assert!(player.latest_state().is_none());
    assert_eq!(
        harness.ledger.token_balance(&player.address()),
        STARTING_TOKENS - PLAYER_DEPOSIT + last.player_balance
    );
    assert_eq!(
        harness.ledger.token_balance(&player.address())
            + harness.ledger.token_balance(&bankroller.address()),
        2 * STARTING_TOKENS
    );
    assert_eq!(bankroller.stats().acks(), 3);
    assert_eq!(bankroller.stats().closes(), 1);

    // Phase 5: disconnect
    player.disconnect().await.unwrap();
    assert!(player.connection_info().is_none());

    let seen = drain(&mut events);
    let statuses = statuses(&seen);
    for expected in [
        "findBankroller",
        "find_complete",
        "connect",
        "connected",
        "ERC20approve",
        "transactionHash",
        "channelOpened",
        "channelClosed",
        "disconnected",
    ] {
        assert!(statuses.contains(&expected), "missing {expected} in {statuses:?}");
    }
}

#[tokio::test]
async fn test_connect_to_named_bankroller() {
    let harness = Harness::new();
    let first = harness
        .bankroller(BANKROLL, BankrollerBehavior::default())
        .await;
    let second = harness
        .bankroller(BANKROLL, BankrollerBehavior::default())
        .await;
    let mut player = harness.player();

    let info = player
        .connect(ConnectTarget::Address(second.address()), PLAYER_DEPOSIT)
        .await
        .unwrap();

    assert_eq!(info.counterparty, second.address());
    assert_eq!(second.stats().connections(), 1);
    assert_eq!(first.stats().connections(), 0);
}

#[tokio::test]
async fn test_zero_deposit_is_rejected_before_any_messaging() {
    let harness = Harness::new();
    let _bankroller = harness
        .bankroller(BANKROLL, BankrollerBehavior::default())
        .await;
    let mut player = harness.player();
    let mut events = player.subscribe_status();

    let result = player.connect(ConnectTarget::Auto, 0).await;

    assert!(matches!(result, Err(ChannelError::Validation(_))));
    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|e| e.topic == StatusTopic::ConnectError && e.status == "deposit null"));
    assert!(harness.ledger.calls().is_empty());
}

#[tokio::test]
async fn test_discovery_skips_bankroller_with_low_capacity() {
    let harness = Harness::new();
    let _small = harness
        .bankroller(PLAYER_DEPOSIT, BankrollerBehavior::default())
        .await;
    let large = harness
        .bankroller(BANKROLL, BankrollerBehavior::default())
        .await;
    let mut player = harness.player();

    let info = player
        .connect(ConnectTarget::Auto, PLAYER_DEPOSIT)
        .await
        .unwrap();

    assert_eq!(info.counterparty, large.address());
}

#[tokio::test]
async fn test_discovery_reports_while_searching() {
    let harness = Harness::new();
    let mut player = harness.player();
    let mut events = player.subscribe_status();

    let result = timeout(
        Duration::from_millis(350),
        player.connect(ConnectTarget::Auto, PLAYER_DEPOSIT),
    )
    .await;

    assert!(result.is_err(), "discovery must keep waiting");
    let seen = drain(&mut events);
    let searching = seen.iter().filter(|e| e.status == "noBankroller").count();
    assert!(searching >= 2, "saw {searching} noBankroller events");
    assert!(harness.network.members(&harness.config.shared_room_name()).is_empty());
}

#[tokio::test]
async fn test_probe_max_deposit() {
    let harness = Harness::new();
    let _small = harness
        .bankroller(PLAYER_DEPOSIT, BankrollerBehavior::default())
        .await;
    let _large = harness
        .bankroller(4 * PLAYER_DEPOSIT, BankrollerBehavior::default())
        .await;
    let player = harness.player();

    let max = player.connections().probe_max_deposit().await.unwrap();

    assert_eq!(max, 2 * PLAYER_DEPOSIT);
}

#[tokio::test]
async fn test_update_channel_is_a_no_op_when_ledger_is_current() {
    let harness = Harness::new();
    let _bankroller = harness
        .bankroller(BANKROLL, BankrollerBehavior::default())
        .await;
    let mut player = harness.player();
    player
        .connect(ConnectTarget::Auto, PLAYER_DEPOSIT)
        .await
        .unwrap();
    let channel = player.open_channel(PLAYER_DEPOSIT).await.unwrap();

    assert_eq!(
        player.update_channel().await.unwrap(),
        UpdateOutcome::NothingToUpdate
    );

    player
        .play_round(RoundInput::new(WAGER, vec![HALF_CHANCE]))
        .await
        .unwrap();

    assert!(matches!(
        player.update_channel().await.unwrap(),
        UpdateOutcome::Submitted(_)
    ));
    assert_eq!(
        player.update_channel().await.unwrap(),
        UpdateOutcome::AlreadyCurrent
    );
    assert_eq!(harness.ledger.update_count(), 1);

    let state = player.latest_state().unwrap();
    harness.ledger.set_channel_record(
        &channel.channel_id,
        OnChainChannel {
            session: state.session + 1,
            total_bet: state.total_bet,
            player_balance: state.player_balance,
            counterparty_balance: state.counterparty_balance,
            is_open: true,
        },
    );
    assert_eq!(
        player.update_channel().await.unwrap(),
        UpdateOutcome::LedgerAhead {
            on_chain: state.session + 1,
            local: state.session,
        }
    );
    assert_eq!(harness.ledger.update_count(), 1);

    harness.ledger.set_channel_record(
        &channel.channel_id,
        OnChainChannel {
            session: state.session,
            total_bet: state.total_bet,
            player_balance: state.player_balance,
            counterparty_balance: state.counterparty_balance,
            is_open: false,
        },
    );
    assert_eq!(
        player.update_channel().await.unwrap(),
        UpdateOutcome::ChannelNotOpen
    );
}

#[tokio::test]
async fn test_close_without_rounds_returns_deposits() {
    let harness = Harness::new();
    let bankroller = harness
        .bankroller(BANKROLL, BankrollerBehavior::default())
        .await;
    let mut player = harness.player();
    player
        .connect(ConnectTarget::Auto, PLAYER_DEPOSIT)
        .await
        .unwrap();
    player.open_channel(PLAYER_DEPOSIT).await.unwrap();

    player.disconnect().await.unwrap();

    assert_eq!(player.lifecycle(), Lifecycle::Closed);
    assert_eq!(
        harness.ledger.token_balance(&player.address()),
        STARTING_TOKENS
    );
    assert_eq!(
        harness.ledger.token_balance(&bankroller.address()),
        STARTING_TOKENS
    );
    let closes = harness
        .ledger
        .calls()
        .into_iter()
        .filter(|c| matches!(c, LedgerCall::CloseByConsent(close) if close.session == 0))
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_operations_require_the_right_lifecycle() {
    let harness = Harness::new();
    let _bankroller = harness
        .bankroller(BANKROLL, BankrollerBehavior::default())
        .await;
    let mut player = harness.player();

    assert!(matches!(
        player.open_channel(PLAYER_DEPOSIT).await,
        Err(ChannelError::InvalidState(_))
    ));
    assert!(matches!(
        player
            .play_round(RoundInput::new(WAGER, vec![HALF_CHANCE]))
            .await,
        Err(ChannelError::InvalidState(_))
    ));
    assert!(matches!(
        player.close_by_consent().await,
        Err(ChannelError::InvalidState(_))
    ));

    player
        .connect(ConnectTarget::Auto, PLAYER_DEPOSIT)
        .await
        .unwrap();
    assert!(matches!(
        player.connect(ConnectTarget::Auto, PLAYER_DEPOSIT).await,
        Err(ChannelError::InvalidState(_))
    ));
    assert!(matches!(
        player.open_channel(0).await,
        Err(ChannelError::Validation(_))
    ));
}

#[tokio::test]
async fn test_invalid_round_input_is_rejected_locally() {
    let harness = Harness::new();
    let bankroller = harness
        .bankroller(BANKROLL, BankrollerBehavior::default())
        .await;
    let mut player = harness.player();
    player
        .connect(ConnectTarget::Auto, PLAYER_DEPOSIT)
        .await
        .unwrap();
    player.open_channel(PLAYER_DEPOSIT).await.unwrap();

    let bad_chance = player.play_round(RoundInput::new(WAGER, vec![0])).await;
    assert!(matches!(bad_chance, Err(ChannelError::Validation(_))));

    let too_large = player
        .play_round(RoundInput::new(2 * PLAYER_DEPOSIT, vec![HALF_CHANCE]))
        .await;
    assert!(matches!(too_large, Err(ChannelError::Validation(_))));

    // A chance of 1 would pay out far more than the bankroller locked
    let uncovered = player.play_round(RoundInput::new(WAGER, vec![1])).await;
    assert!(matches!(uncovered, Err(ChannelError::Validation(_))));

    assert_eq!(player.session(), 0);
    assert_eq!(bankroller.stats().rounds(), 0);
}
