use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::messages::SignalingMessage;
use super::peer::PeerConnection;
use super::types::{OutboundMessage, PeerId, RoomId, SignalingError};

/// Result of a relay: how many members got the message and which ones had
/// to be evicted because delivery failed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub delivered: usize,
    pub evicted: Vec<PeerId>,
    pub now_empty: bool,
}

#[derive(Debug, Default)]
struct RoomState {
    members: HashMap<PeerId, Arc<PeerConnection>>,
    /// Set when the last member leaves. A closed room accepts no joins and is
    /// waiting to be dropped from the registry.
    closed: bool,
}

impl RoomState {
    /// Deliver `msg` to every member except `skip`, returning the ids whose
    /// delivery failed
    fn fan_out(&self, msg: &OutboundMessage, skip: Option<PeerId>) -> (usize, Vec<PeerId>) {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, peer) in &self.members {
            if Some(*id) == skip {
                continue;
            }
            match peer.send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => failed.push(*id),
            }
        }
        (delivered, failed)
    }

    /// Remove `ids` and tell the survivors. Survivors that fail on the
    /// notice are evicted in turn.
    async fn evict(&mut self, room: &RoomId, mut ids: Vec<PeerId>) -> Vec<PeerId> {
        let mut evicted = Vec::new();
        while let Some(id) = ids.pop() {
            let Some(peer) = self.members.remove(&id) else {
                continue;
            };
            peer.close();
            peer.release_room(room).await;
            warn!("Peer {} evicted from room {}", id, room);
            evicted.push(id);

            match SignalingMessage::leave_notification(id, room).encode() {
                Ok(notice) => {
                    let (_, failed) = self.fan_out(&notice, None);
                    ids.extend(failed);
                }
                Err(e) => warn!("Failed to encode leave notice: {}", e),
            }
        }
        evicted
    }

    fn departed(&self) -> Vec<PeerId> {
        self.members
            .iter()
            .filter(|(_, peer)| !peer.is_alive())
            .map(|(id, _)| *id)
            .collect()
    }

    fn mark_closed_if_empty(&mut self) -> bool {
        if self.members.is_empty() {
            self.closed = true;
        }
        self.closed
    }
}

/// A rendezvous point for the peers of one session
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    created_at: Instant,
    capacity: Option<usize>,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(id: RoomId, capacity: Option<usize>) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            capacity,
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.members.is_empty()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Close the room if nobody is in it. Returns `true` when the room is
    /// closed afterwards, after which every join fails with `RoomNotFound`.
    pub async fn close_if_empty(&self) -> bool {
        self.state.lock().await.mark_closed_if_empty()
    }

    pub async fn members(&self) -> Vec<PeerId> {
        self.state.lock().await.members.keys().copied().collect()
    }

    /// Admit `peer`.
    ///
    /// Existing members are notified before the peer is inserted, and the
    /// peer's own acknowledgement is queued after that, all under the room
    /// lock. Nothing the new peer sends can be relayed before the
    /// notification is in every existing member's queue.
    pub async fn join(&self, peer: Arc<PeerConnection>) -> Result<Vec<PeerId>, SignalingError> {
        let mut state = self.state.lock().await;
        let peer_id = peer.id();

        if state.closed {
            return Err(SignalingError::RoomNotFound(self.id.clone()));
        }
        if state.members.contains_key(&peer_id) {
            return Err(SignalingError::AlreadyMember(peer_id));
        }

        // members whose connection dropped still hold a seat until their
        // cleanup task runs
        let departed = state.departed();
        let mut evicted_any = !departed.is_empty();
        if evicted_any {
            state.evict(&self.id, departed).await;
        }

        let admitted = self.admit(&mut state, peer, &mut evicted_any).await;
        if admitted.is_err() && evicted_any {
            state.mark_closed_if_empty();
        }
        admitted
    }

    async fn admit(
        &self,
        state: &mut RoomState,
        peer: Arc<PeerConnection>,
        evicted_any: &mut bool,
    ) -> Result<Vec<PeerId>, SignalingError> {
        let peer_id = peer.id();
        if let Some(capacity) = self.capacity {
            if state.members.len() >= capacity {
                return Err(SignalingError::RoomFull(self.id.clone()));
            }
        }
        if !peer.is_alive() {
            return Err(SignalingError::ConnectionClosed);
        }
        let notice = SignalingMessage::join_notification(peer_id, &self.id).encode()?;
        if !peer.claim_room(&self.id).await {
            return Err(SignalingError::AlreadyMember(peer_id));
        }

        let (_, failed) = state.fan_out(&notice, None);
        if !failed.is_empty() {
            *evicted_any = true;
            state.evict(&self.id, failed).await;
        }

        let existing: Vec<PeerId> = state.members.keys().copied().collect();
        let sent = SignalingMessage::join_ack(peer_id, &self.id, existing.clone())
            .and_then(|ack| ack.encode())
            .and_then(|ack| peer.send(ack));
        if let Err(e) = sent {
            peer.release_room(&self.id).await;
            return Err(e);
        }

        state.members.insert(peer_id, peer);
        info!(
            "Peer {} joined room {} ({} members)",
            peer_id,
            self.id,
            state.members.len()
        );
        Ok(existing)
    }

    /// Remove `peer_id` and notify the remaining members. Returns `true` when
    /// the room is now empty and should be dropped from the registry.
    pub async fn leave(&self, peer_id: PeerId) -> bool {
        let mut state = self.state.lock().await;
        let Some(peer) = state.members.remove(&peer_id) else {
            return state.members.is_empty() && state.closed;
        };
        peer.release_room(&self.id).await;
        info!("Peer {} left room {}", peer_id, self.id);

        match SignalingMessage::leave_notification(peer_id, &self.id).encode() {
            Ok(notice) => {
                let (_, failed) = state.fan_out(&notice, None);
                if !failed.is_empty() {
                    state.evict(&self.id, failed).await;
                }
            }
            Err(e) => warn!("Failed to encode leave notice: {}", e),
        }

        state.mark_closed_if_empty()
    }

    /// Deliver `msg` to its target, or to every member but the sender when
    /// it names none.
    pub async fn relay(&self, msg: &SignalingMessage) -> Result<RelayOutcome, SignalingError> {
        let mut state = self.state.lock().await;
        let sender = msg.sender_id;

        if !state.members.contains_key(&sender) {
            return Err(SignalingError::NotInRoom(sender));
        }

        let encoded = msg.encode()?;
        let (delivered, failed) = match msg.target_id {
            Some(target) => {
                let peer = state
                    .members
                    .get(&target)
                    .filter(|_| target != sender)
                    .ok_or(SignalingError::UnknownTarget(target))?;
                match peer.send(encoded) {
                    Ok(()) => (1, Vec::new()),
                    Err(_) => (0, vec![target]),
                }
            }
            None => state.fan_out(&encoded, Some(sender)),
        };
        debug!(
            "Relayed {:?} from {} in room {} to {} peer(s)",
            msg.kind, sender, self.id, delivered
        );

        let evicted = if failed.is_empty() {
            Vec::new()
        } else {
            state.evict(&self.id, failed).await
        };

        Ok(RelayOutcome {
            delivered,
            evicted,
            now_empty: state.mark_closed_if_empty(),
        })
    }
}
