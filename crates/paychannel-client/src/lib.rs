//! Paychannel Client
//!
//! Player-side engine of an off-chain payment channel with a bankroller:
//! - `RequestBus` correlating peer requests and responses
//! - `StateStore` holding the latest co-signed channel state
//! - `ConnectionManager` for discovery and the private-room handshake
//! - `GameplaySession` for signed per-round exchanges
//! - `ChannelController` driving open, close, update and dispute
//!
//! `MemoryNetwork` and `MockBankroller` make the whole flow runnable
//! in-process against a `MockLedger`.

pub mod bankroller;
pub mod bus;
pub mod config;
pub mod connection;
pub mod controller;
pub mod crypto_worker;
pub mod error;
pub mod events;
pub mod games;
pub mod gameplay;
pub mod protocol;
pub mod store;
pub mod transport;

pub use bankroller::{BankrollerBehavior, BankrollerHandle, MockBankroller};
pub use bus::RequestBus;
pub use config::ChannelConfig;
pub use connection::{ConnectTarget, ConnectionManager, PeerLink};
pub use controller::{ChannelController, Lifecycle, UpdateOutcome};
pub use crypto_worker::CryptoWorker;
pub use error::ChannelError;
pub use events::{StatusEvent, StatusHub, StatusTopic};
pub use games::{DiceGame, GameLogic, GameOutcome, PayChannel};
pub use gameplay::{GameplaySession, RoundError};
pub use protocol::{ChannelDescriptor, ChannelState, ConnectionInfo, RoundInput, RoundReport, RoundRequest};
pub use store::StateStore;
pub use transport::{MemoryNetwork, RoomOptions, Transport, TransportFactory};
