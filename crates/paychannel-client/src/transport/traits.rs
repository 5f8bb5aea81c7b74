//! Transport trait definitions.

use crate::error::ChannelError;
use crate::protocol::Envelope;
use async_trait::async_trait;
use paychannel_core::Address;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Options for joining a room
#[derive(Clone, Default)]
pub struct RoomOptions {
    /// Key used to authenticate as the joining member
    pub private_key: Option<[u8; 32]>,
    /// When set, messages from any other sender are dropped
    pub allowed_users: Option<Vec<Address>>,
}

impl RoomOptions {
    /// Private room shared with a single peer
    pub fn private(private_key: [u8; 32], peer: Address) -> Self {
        Self {
            private_key: Some(private_key),
            allowed_users: Some(vec![peer]),
        }
    }
}

/// Membership in one messaging room
///
/// Incoming messages exclude the member's own messages and messages
/// addressed to somebody else.
#[async_trait]
pub trait Transport: Send + Sync {
    fn room(&self) -> &str;

    /// Stream of incoming messages; dropping the receiver unsubscribes
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;

    /// Send and report whether the addressed member received it
    async fn send(&self, envelope: Envelope) -> Result<bool, ChannelError>;

    fn send_fire_and_forget(&self, envelope: Envelope);

    async fn leave(&self);
}

/// Opens rooms on a messaging network
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn join(
        &self,
        member: Address,
        room: &str,
        options: RoomOptions,
    ) -> Result<Arc<dyn Transport>, ChannelError>;
}
