//! Request/response correlation over a transport room.

use crate::error::ChannelError;
use crate::protocol::{Action, CorrelationId, Envelope, MessageKind};
use crate::transport::Transport;
use paychannel_core::Address;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Pending = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<Envelope>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<Envelope>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Correlates outgoing requests with their responses
///
/// A router task reads the room: responses complete the waiter registered
/// under their correlation id, everything else is republished on
/// [`RequestBus::incoming`]. Waiters have no timeout of their own.
pub struct RequestBus {
    transport: Arc<dyn Transport>,
    local: Address,
    pending: Pending,
    incoming: broadcast::Sender<Envelope>,
    router: JoinHandle<()>,
}

impl RequestBus {
    pub fn new(transport: Arc<dyn Transport>, local: Address) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (incoming, _) = broadcast::channel(128);
        let router = tokio::spawn(route(
            transport.subscribe(),
            pending.clone(),
            incoming.clone(),
        ));
        Self {
            transport,
            local,
            pending,
            incoming,
            router,
        }
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Requests and broadcasts received from peers
    pub fn incoming(&self) -> broadcast::Receiver<Envelope> {
        self.incoming.subscribe()
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        let mut pending = lock(&self.pending);
        pending.retain(|_, waiter| !waiter.is_closed());
        pending.len()
    }

    /// Stamp `envelope` with a fresh correlation id and send it
    ///
    /// The returned receiver completes when the matching response arrives.
    /// With `require_ack`, a transport that reports non-delivery rejects
    /// the send with [`ChannelError::Undelivered`].
    pub async fn send(
        &self,
        mut envelope: Envelope,
        require_ack: bool,
    ) -> Result<oneshot::Receiver<Envelope>, ChannelError> {
        let id = CorrelationId::new();
        envelope.correlation_id = Some(id);
        envelope.sender = self.local;
        let action = envelope.action;

        let (waiter, response) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            pending.retain(|_, waiter| !waiter.is_closed());
            pending.insert(id, waiter);
        }

        let delivered = match self.transport.send(envelope).await {
            Ok(delivered) => delivered,
            Err(e) => {
                lock(&self.pending).remove(&id);
                return Err(e);
            }
        };
        if require_ack && !delivered {
            lock(&self.pending).remove(&id);
            warn!(action = %action, correlation_id = %id, "message not delivered");
            return Err(ChannelError::Undelivered(action));
        }

        debug!(action = %action, correlation_id = %id, delivered, "request sent");
        Ok(response)
    }

    /// Send a request to `recipient` and wait for its response
    pub async fn request<T: Serialize>(
        &self,
        action: Action,
        recipient: Address,
        payload: &T,
        require_ack: bool,
    ) -> Result<Envelope, ChannelError> {
        let envelope = Envelope::request(
            action,
            self.local,
            recipient,
            serde_json::to_value(payload)?,
        );
        let response = self.send(envelope, require_ack).await?;
        response.await.map_err(|_| {
            ChannelError::Transport(format!("{} response channel closed", action))
        })
    }

    /// Answer `request` with `payload`
    pub async fn respond<T: Serialize>(
        &self,
        request: &Envelope,
        payload: &T,
    ) -> Result<(), ChannelError> {
        let response = request.response_to(self.local, serde_json::to_value(payload)?);
        self.transport.send(response).await?;
        Ok(())
    }
}

impl Drop for RequestBus {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route(
    mut inbound: broadcast::Receiver<Envelope>,
    pending: Pending,
    incoming: broadcast::Sender<Envelope>,
) {
    loop {
        match inbound.recv().await {
            Ok(envelope) => match envelope.kind {
                MessageKind::Response => {
                    let waiter = envelope
                        .correlation_id
                        .and_then(|id| lock(&pending).remove(&id));
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(envelope);
                        }
                        None => {
                            debug!(action = %envelope.action, "unmatched response dropped");
                        }
                    }
                }
                MessageKind::Request | MessageKind::Broadcast => {
                    let _ = incoming.send(envelope);
                }
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "request bus lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, RoomOptions, TransportFactory};
    use paychannel_core::Identity;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn pair() -> (RequestBus, RequestBus) {
        let network = MemoryNetwork::new();
        let a = Identity::generate().address();
        let b = Identity::generate().address();
        let room_a = network.join(a, "bus", RoomOptions::default()).await.unwrap();
        let room_b = network.join(b, "bus", RoomOptions::default()).await.unwrap();
        (RequestBus::new(room_a, a), RequestBus::new(room_b, b))
    }

    #[tokio::test]
    async fn test_request_is_matched_with_response() {
        let (client, server) = pair().await;
        let mut requests = server.incoming();
        let server_address = server.local_address();

        let responder = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            assert!(request.is_request(Action::CheckOpenChannel));
            server.respond(&request, &json!({ "status": "ok" })).await.unwrap();
            server
        });

        let response = timeout(
            Duration::from_secs(1),
            client.request(Action::CheckOpenChannel, server_address, &json!({}), true),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.kind, MessageKind::Response);
        assert_eq!(response.payload["status"], "ok");
        assert_eq!(client.pending_count(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_correlation_ids_are_unique() {
        let (client, server) = pair().await;
        let mut requests = server.incoming();

        let recipient = server.local_address();
        let make = || Envelope::request(Action::Call, recipient, recipient, Value::Null);
        let _first = client.send(make(), true).await.unwrap();
        let _second = client.send(make(), true).await.unwrap();

        let one = requests.recv().await.unwrap();
        let two = requests.recv().await.unwrap();
        assert!(one.correlation_id.is_some());
        assert_ne!(one.correlation_id, two.correlation_id);
        assert_eq!(one.sender, client.local_address());
        assert_eq!(client.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_undelivered_request_is_rejected() {
        let (client, _server) = pair().await;
        let nobody = Address::from_bytes([0x42; 20]);

        let result = client.request(Action::Call, nobody, &json!({}), true).await;

        assert!(matches!(result, Err(ChannelError::Undelivered(Action::Call))));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_undelivered_without_ack_still_waits() {
        let (client, _server) = pair().await;
        let nobody = Address::from_bytes([0x42; 20]);

        let envelope = Envelope::request(Action::Connect, nobody, nobody, json!({}));
        let response = client.send(envelope, false).await.unwrap();

        assert!(timeout(Duration::from_millis(50), response).await.is_err());
    }
}
