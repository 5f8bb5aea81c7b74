//! In-process messaging network.

use super::traits::{RoomOptions, Transport, TransportFactory};
use crate::error::ChannelError;
use crate::protocol::Envelope;
use async_trait::async_trait;
use paychannel_core::{Address, Identity};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const ROOM_CAPACITY: usize = 256;

struct Room {
    hub: broadcast::Sender<Envelope>,
    members: HashSet<Address>,
}

/// Network of named rooms living in this process
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    rooms: Arc<Mutex<HashMap<String, Room>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current members of a room
    pub fn members(&self, room: &str) -> Vec<Address> {
        self.rooms()
            .get(room)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default()
    }

    fn is_delivered(&self, room: &str, sender: &Address, recipient: Option<&Address>) -> bool {
        let rooms = self.rooms();
        let Some(room) = rooms.get(room) else {
            return false;
        };
        match recipient {
            Some(recipient) => room.members.contains(recipient),
            None => room.members.iter().any(|m| m != sender),
        }
    }

    fn remove_member(&self, room: &str, member: &Address) {
        let mut rooms = self.rooms();
        if let Some(entry) = rooms.get_mut(room) {
            entry.members.remove(member);
            if entry.members.is_empty() {
                rooms.remove(room);
            }
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryNetwork {
    async fn join(
        &self,
        member: Address,
        room: &str,
        options: RoomOptions,
    ) -> Result<Arc<dyn Transport>, ChannelError> {
        if let Some(key) = &options.private_key {
            let owner = Identity::from_secret_bytes(key)?.address();
            if owner != member {
                return Err(ChannelError::Transport(format!(
                    "room key belongs to {}, not {}",
                    owner, member
                )));
            }
        }

        let hub = {
            let mut rooms = self.rooms();
            let entry = rooms.entry(room.to_string()).or_insert_with(|| Room {
                hub: broadcast::channel(ROOM_CAPACITY).0,
                members: HashSet::new(),
            });
            entry.members.insert(member);
            entry.hub.clone()
        };

        let (inbox, _) = broadcast::channel(ROOM_CAPACITY);
        let forwarder = tokio::spawn(forward(
            hub.subscribe(),
            inbox.clone(),
            member,
            options.allowed_users,
        ));

        debug!(room, member = %member, "joined room");
        Ok(Arc::new(MemoryTransport {
            network: self.clone(),
            room: room.to_string(),
            member,
            hub,
            inbox,
            forwarder,
            left: AtomicBool::new(false),
        }))
    }
}

/// Copy room traffic meant for `member` into its inbox
async fn forward(
    mut room: broadcast::Receiver<Envelope>,
    inbox: broadcast::Sender<Envelope>,
    member: Address,
    allowed_users: Option<Vec<Address>>,
) {
    loop {
        match room.recv().await {
            Ok(envelope) => {
                if envelope.sender == member {
                    continue;
                }
                if envelope.recipient.is_some_and(|r| r != member) {
                    continue;
                }
                if let Some(allowed) = &allowed_users {
                    if !allowed.contains(&envelope.sender) {
                        debug!(sender = %envelope.sender, "dropping message from non-allowed sender");
                        continue;
                    }
                }
                let _ = inbox.send(envelope);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(member = %member, skipped, "room receiver lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// One member's handle on a [`MemoryNetwork`] room
pub struct MemoryTransport {
    network: MemoryNetwork,
    room: String,
    member: Address,
    hub: broadcast::Sender<Envelope>,
    inbox: broadcast::Sender<Envelope>,
    forwarder: JoinHandle<()>,
    left: AtomicBool,
}

impl MemoryTransport {
    fn depart(&self) {
        if !self.left.swap(true, Ordering::SeqCst) {
            self.forwarder.abort();
            self.network.remove_member(&self.room, &self.member);
            debug!(room = %self.room, member = %self.member, "left room");
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn room(&self) -> &str {
        &self.room
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbox.subscribe()
    }

    async fn send(&self, envelope: Envelope) -> Result<bool, ChannelError> {
        if self.left.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport(format!("already left {}", self.room)));
        }
        let delivered =
            self.network
                .is_delivered(&self.room, &self.member, envelope.recipient.as_ref());
        let _ = self.hub.send(envelope);
        Ok(delivered)
    }

    fn send_fire_and_forget(&self, envelope: Envelope) {
        if !self.left.load(Ordering::SeqCst) {
            let _ = self.hub.send(envelope);
        }
    }

    async fn leave(&self) {
        self.depart();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.depart();
    }
}
