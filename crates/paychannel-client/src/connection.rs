//! Counterparty discovery and the connection handshake.

use crate::bus::RequestBus;
use crate::config::ChannelConfig;
use crate::crypto_worker::CryptoWorker;
use crate::error::ChannelError;
use crate::events::{StatusHub, StatusTopic};
use crate::protocol::messages::{Availability, ConnectRequest, ConnectResponse};
use crate::protocol::{Action, ConnectionInfo, Envelope, MessageKind};
use crate::transport::{RoomOptions, Transport, TransportFactory};
use paychannel_core::Address;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

/// Availability announcements sampled by [`ConnectionManager::probe_max_deposit`]
pub const DEPOSIT_PROBE_SAMPLES: usize = 10;

/// Who to connect to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectTarget {
    /// Take the first counterparty that can cover the deposit
    Auto,
    Address(Address),
}

/// An established private connection
pub struct PeerLink {
    pub info: ConnectionInfo,
    pub bus: RequestBus,
}

/// Finds counterparties and performs the connect handshake
pub struct ConnectionManager {
    config: ChannelConfig,
    transports: Arc<dyn TransportFactory>,
    crypto: CryptoWorker,
    status: StatusHub,
}

impl ConnectionManager {
    pub fn new(
        config: ChannelConfig,
        transports: Arc<dyn TransportFactory>,
        crypto: CryptoWorker,
        status: StatusHub,
    ) -> Self {
        Self {
            config,
            transports,
            crypto,
            status,
        }
    }

    fn local(&self) -> Address {
        self.crypto.address()
    }

    async fn join_shared_room(&self) -> Result<(Arc<dyn Transport>, RequestBus), ChannelError> {
        let room = self
            .transports
            .join(self.local(), &self.config.shared_room_name(), RoomOptions::default())
            .await?;
        let bus = RequestBus::new(room.clone(), self.local());
        Ok((room, bus))
    }

    /// Connect to a counterparty able to stake against `deposit`
    ///
    /// On success the shared room is left and a private room restricted to
    /// the counterparty is joined.
    pub async fn connect(
        &self,
        target: ConnectTarget,
        deposit: u128,
    ) -> Result<PeerLink, ChannelError> {
        if deposit == 0 {
            self.status
                .emit(StatusTopic::ConnectError, "deposit null", json!({}));
            return Err(ChannelError::Validation("deposit null".into()));
        }

        let (shared, shared_bus) = self.join_shared_room().await?;
        let result = self.handshake(&shared_bus, target, deposit).await;
        drop(shared_bus);
        shared.leave().await;
        let (counterparty, connection) = result?;

        let room_name = self.config.private_room_name(&connection.connection_id);
        let key = self.crypto.export_secret().await?;
        let private = self
            .transports
            .join(self.local(), &room_name, RoomOptions::private(key, counterparty))
            .await?;
        let bus = RequestBus::new(private, self.local());

        info!(counterparty = %counterparty, room = %room_name, "connected");
        Ok(PeerLink {
            info: ConnectionInfo {
                counterparty,
                connection_id: connection.connection_id,
                room_name,
                channel: None,
            },
            bus,
        })
    }

    async fn handshake(
        &self,
        shared: &RequestBus,
        target: ConnectTarget,
        deposit: u128,
    ) -> Result<(Address, ConnectResponse), ChannelError> {
        let counterparty = match target {
            ConnectTarget::Address(address) => address,
            ConnectTarget::Auto => {
                let required = self.config.required_counterparty_deposit(deposit);
                self.status.emit(
                    StatusTopic::ConnectInfo,
                    "findBankroller",
                    json!({ "deposit": required.to_string() }),
                );
                let found = self.discover(shared, required).await?;
                self.status.emit(
                    StatusTopic::ConnectInfo,
                    "find_complete",
                    json!({ "counterparty": found }),
                );
                found
            }
        };

        self.status.emit(
            StatusTopic::ConnectInfo,
            "connect",
            json!({ "counterparty": counterparty }),
        );
        let request = ConnectRequest {
            slug: self.config.app_slug.clone(),
            player: self.local(),
        };
        let budget = self.config.handshake_timeout();
        let handshake = shared.request(Action::Connect, counterparty, &request, false);
        let reply = match timeout(budget, handshake).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!(counterparty = %counterparty, ?budget, "handshake timed out");
                self.status.emit(
                    StatusTopic::Error,
                    "timeout",
                    json!({ "text": "Connection timeout" }),
                );
                return Err(ChannelError::HandshakeTimeout(budget));
            }
        };

        let connection: ConnectResponse = match reply.reply() {
            Ok(connection) => connection,
            Err(e) => {
                self.status.emit(
                    StatusTopic::Error,
                    "unknown",
                    json!({ "text": "Cant establish connection", "err": e.to_string() }),
                );
                return Err(e);
            }
        };
        self.status.emit(
            StatusTopic::ConnectInfo,
            "connected",
            json!({ "connection_id": connection.connection_id }),
        );
        Ok((counterparty, connection))
    }

    /// Wait for a counterparty whose advertised deposit covers `required_deposit`
    ///
    /// Emits `bankrollerInfo` for every announcement seen and `noBankroller`
    /// every discovery interval while waiting. Never gives up on its own;
    /// drop the future to abandon.
    pub async fn find_counterparty(&self, required_deposit: u128) -> Result<Address, ChannelError> {
        let (shared, bus) = self.join_shared_room().await?;
        let found = self.discover(&bus, required_deposit).await;
        drop(bus);
        shared.leave().await;
        found
    }

    async fn discover(&self, bus: &RequestBus, required_deposit: u128) -> Result<Address, ChannelError> {
        let mut announcements = bus.incoming();
        let period = self.config.discovery_status_interval();
        let mut searching = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = searching.tick() => {
                    self.status.emit(
                        StatusTopic::ConnectInfo,
                        "noBankroller",
                        json!({ "deposit": required_deposit.to_string() }),
                    );
                }
                message = announcements.recv() => {
                    let Some((sender, availability)) = parse_availability(message)? else {
                        continue;
                    };
                    self.status.emit(
                        StatusTopic::ConnectInfo,
                        "bankrollerInfo",
                        json!({
                            "counterparty": sender,
                            "deposit": availability.deposit.to_string(),
                        }),
                    );
                    if availability.deposit >= required_deposit {
                        debug!(counterparty = %sender, deposit = %availability.deposit, "counterparty found");
                        return Ok(sender);
                    }
                    debug!(
                        counterparty = %sender,
                        deposit = %availability.deposit,
                        required = %required_deposit,
                        "ignoring counterparty with low deposit"
                    );
                }
            }
        }
    }

    /// Largest player deposit the currently announced counterparties could match
    ///
    /// Watches the first [`DEPOSIT_PROBE_SAMPLES`] announcements and reports
    /// half of the largest advertised deposit.
    pub async fn probe_max_deposit(&self) -> Result<u128, ChannelError> {
        let (shared, bus) = self.join_shared_room().await?;
        let mut announcements = bus.incoming();
        let mut largest = 0u128;
        let mut seen = 0;

        let outcome = loop {
            if seen == DEPOSIT_PROBE_SAMPLES {
                break Ok(largest / 2);
            }
            match parse_availability(announcements.recv().await) {
                Ok(Some((_, availability))) => {
                    seen += 1;
                    largest = largest.max(availability.deposit);
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };

        drop(bus);
        shared.leave().await;
        outcome
    }
}

/// Extract an availability announcement from a bus message
fn parse_availability(
    message: Result<Envelope, RecvError>,
) -> Result<Option<(Address, Availability)>, ChannelError> {
    match message {
        Ok(envelope)
            if envelope.kind == MessageKind::Broadcast
                && envelope.action == Action::BankrollerActive =>
        {
            match envelope.decode::<Availability>() {
                Ok(availability) => Ok(Some((envelope.sender, availability))),
                Err(e) => {
                    warn!(sender = %envelope.sender, error = %e, "bad availability announcement");
                    Ok(None)
                }
            }
        }
        Ok(_) => Ok(None),
        Err(RecvError::Lagged(skipped)) => {
            debug!(skipped, "discovery lagged");
            Ok(None)
        }
        Err(RecvError::Closed) => Err(ChannelError::Transport("discovery room closed".into())),
    }
}
