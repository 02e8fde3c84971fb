use std::sync::Arc;

use tracing::{debug, info, warn};

use super::messages::{ClientMessage, MessageKind, SignalingMessage};
use super::peer::{Inbound, PeerConnection};
use super::registry::RoomRegistry;
use super::types::{RoomId, SignalingError};

/// Handle to feed the broadcaster's queue
#[derive(Clone, Debug)]
pub struct BroadcasterHandle {
    tx: async_channel::Sender<Inbound>,
}

impl BroadcasterHandle {
    /// Queue a message for routing. Waits while the queue is full.
    pub async fn submit(&self, inbound: Inbound) -> Result<(), SignalingError> {
        self.tx
            .send(inbound)
            .await
            .map_err(|_| SignalingError::Internal("broadcaster stopped".to_string()))
    }
}

/// Single dispatch loop that routes every inbound message to its room.
///
/// Messages are handled one at a time in arrival order, which keeps
/// per-room delivery order equal to arrival order.
pub struct Broadcaster {
    registry: Arc<RoomRegistry>,
    rx: async_channel::Receiver<Inbound>,
}

impl Broadcaster {
    pub fn new(registry: Arc<RoomRegistry>, queue_capacity: usize) -> (Self, BroadcasterHandle) {
        let (tx, rx) = async_channel::bounded(queue_capacity.max(1));
        (Self { registry, rx }, BroadcasterHandle { tx })
    }

    /// Start the loop on the runtime and return its handle
    pub fn spawn(registry: Arc<RoomRegistry>, queue_capacity: usize) -> BroadcasterHandle {
        let (broadcaster, handle) = Self::new(registry, queue_capacity);
        tokio::spawn(broadcaster.run());
        handle
    }

    /// Drain the queue until every handle is gone
    pub async fn run(self) {
        info!("Broadcaster running");
        while let Ok(inbound) = self.rx.recv().await {
            self.dispatch(inbound).await;
        }
        info!("Broadcaster stopped");
    }

    /// Route one message, reporting any failure back to its sender
    pub async fn dispatch(&self, inbound: Inbound) {
        let Inbound { peer, message } = inbound;
        if let Err(e) = self.route(&peer, message).await {
            debug!("Dropping message from {}: {}", peer.id(), e);
            report_error(&peer, &e).await;
        }
    }

    async fn route(
        &self,
        peer: &PeerConnection,
        message: Result<ClientMessage, SignalingError>,
    ) -> Result<(), SignalingError> {
        let msg = message?;

        if let Some(claimed) = msg.sender_id {
            if claimed != peer.id() {
                return Err(SignalingError::MalformedMessage(
                    "senderID does not match the connection".to_string(),
                ));
            }
        }

        let room_id = peer
            .room()
            .await
            .ok_or_else(|| SignalingError::NotInRoom(peer.id()))?;
        if let Some(claimed) = &msg.room_id {
            if *claimed != room_id {
                return Err(SignalingError::MalformedMessage(
                    "roomID does not match the sender's room".to_string(),
                ));
            }
        }

        if msg.kind == MessageKind::Leave {
            self.registry.leave(peer).await;
            return Ok(());
        }
        if !msg.kind.is_negotiation() {
            return Err(SignalingError::MalformedMessage(format!(
                "{:?} messages cannot be sent by peers",
                msg.kind
            )));
        }

        let room = self
            .registry
            .get(&room_id)
            .await
            .ok_or_else(|| SignalingError::RoomNotFound(room_id.clone()))?;

        let relayed = SignalingMessage {
            kind: msg.kind,
            sender_id: peer.id(),
            room_id: Some(room_id.clone()),
            target_id: msg.target_id,
            payload: msg.payload,
        };
        let outcome = room.relay(&relayed).await?;

        if !outcome.evicted.is_empty() {
            warn!(
                "Relay in room {} evicted {} unresponsive peer(s)",
                room_id,
                outcome.evicted.len()
            );
        }
        if outcome.now_empty {
            self.registry.remove_if_empty(&room_id).await;
        }
        if relayed.target_id.is_some() && outcome.delivered == 0 {
            return Err(SignalingError::ConnectionClosed);
        }
        Ok(())
    }
}

async fn report_error(peer: &PeerConnection, err: &SignalingError) {
    let room: Option<RoomId> = peer.room().await;
    let sent = SignalingMessage::error(peer.id(), room, err)
        .and_then(|msg| msg.encode())
        .and_then(|msg| peer.send(msg));
    if let Err(e) = sent {
        debug!("Could not report error to {}: {}", peer.id(), e);
    }
}
