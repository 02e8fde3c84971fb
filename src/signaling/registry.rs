use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::peer::PeerConnection;
use super::room::Room;
use super::types::{PeerId, RoomId, SignalingError};

/// Directory of live rooms.
///
/// The map has its own lock and every room has another; nothing holds the
/// registry lock while waiting on a room except `remove_if_empty` and
/// `reap_unclaimed`, and room operations never take the registry lock.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Arc<Room>>>,
    room_capacity: Option<usize>,
}

impl RoomRegistry {
    pub fn new(room_capacity: Option<usize>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            room_capacity,
        }
    }

    /// Reset to an empty directory. Called once before accepting connections.
    pub async fn init(&self) {
        let mut rooms = self.rooms.lock().await;
        rooms.clear();
        info!(
            "Room registry initialized (capacity: {})",
            self.room_capacity
                .map_or_else(|| "unrestricted".to_string(), |c| c.to_string())
        );
    }

    /// Create an empty room, under `requested` if given.
    pub async fn create_room(&self, requested: Option<RoomId>) -> Result<RoomId, SignalingError> {
        let mut rooms = self.rooms.lock().await;

        let id = match requested {
            Some(id) => {
                if let Some(existing) = rooms.get(&id) {
                    // a closed room is only waiting to be reclaimed
                    if !existing.is_closed().await {
                        return Err(SignalingError::RoomIdConflict(id));
                    }
                }
                id
            }
            None => loop {
                let candidate = RoomId::generate();
                if !rooms.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        rooms.insert(id.clone(), Arc::new(Room::new(id.clone(), self.room_capacity)));
        info!("Room created: {}", id);
        Ok(id)
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Admit `peer` into `room_id`.
    ///
    /// Returns the guard that owns the peer's cleanup, and the ids of the
    /// members that were already there.
    pub async fn join_room(
        self: &Arc<Self>,
        room_id: &RoomId,
        peer: Arc<PeerConnection>,
    ) -> Result<(Membership, Vec<PeerId>), SignalingError> {
        let room = self
            .get(room_id)
            .await
            .ok_or_else(|| SignalingError::RoomNotFound(room_id.clone()))?;

        match room.join(Arc::clone(&peer)).await {
            Ok(existing) => Ok((Membership::new(peer, Arc::clone(self)), existing)),
            Err(e) => {
                self.remove_if_empty(room_id).await;
                Err(e)
            }
        }
    }

    /// Take `peer` out of whatever room it is in. No-op if it is in none.
    pub async fn leave(&self, peer: &PeerConnection) {
        let Some(room_id) = peer.room().await else {
            return;
        };
        let Some(room) = self.get(&room_id).await else {
            return;
        };
        if room.leave(peer.id()).await {
            self.remove_if_empty(&room_id).await;
        }
    }

    /// Drop `room_id` once its last member has left. Idempotent.
    pub async fn remove_if_empty(&self, room_id: &RoomId) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get(room_id) else {
            return;
        };
        if room.is_closed().await {
            rooms.remove(room_id);
            info!("Room {} removed (empty)", room_id);
        }
    }

    /// Drop rooms that nobody joined within `max_age` of being created.
    /// Returns how many were removed.
    pub async fn reap_unclaimed(&self, max_age: Duration) -> usize {
        let mut rooms = self.rooms.lock().await;
        let mut stale = Vec::new();
        for (id, room) in rooms.iter() {
            // closing first makes a join that already looked the room up fail
            let reclaim = if room.created_at().elapsed() >= max_age {
                room.close_if_empty().await
            } else {
                room.is_closed().await
            };
            if reclaim {
                stale.push(id.clone());
            }
        }
        for id in &stale {
            rooms.remove(id);
            info!("Room {} removed (never joined)", id);
        }
        stale.len()
    }
}

/// Scoped ownership of a peer's place in a room.
///
/// Dropping or releasing the guard closes the connection and removes the
/// peer from its room, exactly once.
#[derive(Debug)]
pub struct Membership {
    peer: Arc<PeerConnection>,
    registry: Arc<RoomRegistry>,
    released: bool,
}

impl Membership {
    fn new(peer: Arc<PeerConnection>, registry: Arc<RoomRegistry>) -> Self {
        Self {
            peer,
            registry,
            released: false,
        }
    }

    pub fn peer(&self) -> &Arc<PeerConnection> {
        &self.peer
    }

    pub async fn release(mut self) {
        self.released = true;
        self.peer.close();
        self.registry.leave(&self.peer).await;
        debug!("Membership of {} released", self.peer.id());
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.peer.close();

        let peer = Arc::clone(&self.peer);
        let registry = Arc::clone(&self.registry);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    registry.leave(&peer).await;
                    debug!("Membership of {} dropped", peer.id());
                });
            }
            Err(_) => warn!(
                "Membership of {} dropped outside a runtime, room not cleaned up",
                peer.id()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::types::OutboundMessage;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn registry(capacity: Option<usize>) -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(capacity))
    }

    fn peer() -> (Arc<PeerConnection>, mpsc::Receiver<OutboundMessage>) {
        PeerConnection::new(PeerId::generate(), 16)
    }

    #[tokio::test]
    async fn create_generates_unique_ids() {
        let registry = registry(None);
        let mut ids = HashSet::new();
        for _ in 0..100 {
            ids.insert(registry.create_room(None).await.unwrap());
        }
        assert_eq!(ids.len(), 100);
        assert_eq!(registry.room_count().await, 100);
    }

    #[tokio::test]
    async fn create_with_taken_id_conflicts() {
        let registry = registry(None);
        let id = RoomId::parse("standup").unwrap();
        assert_eq!(registry.create_room(Some(id.clone())).await, Ok(id.clone()));
        assert_eq!(
            registry.create_room(Some(id.clone())).await,
            Err(SignalingError::RoomIdConflict(id))
        );
    }

    #[tokio::test]
    async fn init_clears_rooms() {
        let registry = registry(None);
        registry.create_room(None).await.unwrap();
        registry.init().await;
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn join_missing_room() {
        let registry = registry(None);
        let (a, _rx) = peer();
        let id = RoomId::parse("nowhere").unwrap();
        let err = registry.join_room(&id, a).await.unwrap_err();
        assert_eq!(err, SignalingError::RoomNotFound(id));
    }

    #[tokio::test]
    async fn create_join_relay_round_trip() {
        use crate::signaling::messages::{MessageKind, SignalingMessage};

        let registry = registry(None);
        let id = registry.create_room(None).await.unwrap();
        let (a, mut a_rx) = peer();
        let (b, mut b_rx) = peer();

        let (_ma, _) = registry.join_room(&id, a.clone()).await.unwrap();
        let (_mb, existing) = registry.join_room(&id, b.clone()).await.unwrap();
        assert_eq!(existing, vec![a.id()]);
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}

        let room = registry.get(&id).await.unwrap();
        let msg = SignalingMessage {
            kind: MessageKind::Offer,
            sender_id: a.id(),
            room_id: Some(id.clone()),
            target_id: None,
            payload: None,
        };
        room.relay(&msg).await.unwrap();

        let got: SignalingMessage =
            serde_json::from_str(b_rx.recv().await.unwrap().as_str()).unwrap();
        assert_eq!(got.sender_id, a.id());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sole_member_leaving_removes_room() {
        let registry = registry(None);
        let id = registry.create_room(None).await.unwrap();
        let (a, _rx) = peer();

        let (membership, _) = registry.join_room(&id, a.clone()).await.unwrap();
        membership.release().await;

        assert!(registry.get(&id).await.is_none());
        assert!(!a.is_alive());
    }

    #[tokio::test]
    async fn room_survives_while_members_remain() {
        let registry = registry(None);
        let id = registry.create_room(None).await.unwrap();
        let (a, _a_rx) = peer();
        let (b, _b_rx) = peer();

        let (ma, _) = registry.join_room(&id, a.clone()).await.unwrap();
        let (mb, _) = registry.join_room(&id, b.clone()).await.unwrap();

        ma.release().await;
        assert_eq!(registry.get(&id).await.unwrap().len().await, 1);
        mb.release().await;
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn dropped_membership_cleans_up() {
        let registry = registry(None);
        let id = registry.create_room(None).await.unwrap();
        let (a, _rx) = peer();

        let (membership, _) = registry.join_room(&id, a.clone()).await.unwrap();
        drop(membership);

        for _ in 0..50 {
            if registry.get(&id).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn explicit_leave_is_idempotent() {
        let registry = registry(None);
        let id = registry.create_room(None).await.unwrap();
        let (a, _rx) = peer();

        let (membership, _) = registry.join_room(&id, a.clone()).await.unwrap();
        registry.leave(&a).await;
        registry.leave(&a).await;
        assert!(registry.get(&id).await.is_none());
        assert_eq!(a.room().await, None);

        // the guard still runs, and finds nothing left to do
        membership.release().await;
        registry.remove_if_empty(&id).await;
    }

    #[tokio::test]
    async fn capacity_two_rejects_third_peer() {
        let registry = registry(Some(2));
        let id = registry.create_room(None).await.unwrap();
        let (a, _a_rx) = peer();
        let (b, _b_rx) = peer();
        let (c, _c_rx) = peer();

        let _ma = registry.join_room(&id, a.clone()).await.unwrap();
        let _mb = registry.join_room(&id, b.clone()).await.unwrap();
        let err = registry.join_room(&id, c).await.unwrap_err();
        assert_eq!(err, SignalingError::RoomFull(id.clone()));

        let room = registry.get(&id).await.unwrap();
        let mut members = room.members().await;
        members.sort_by_key(|p| p.to_string());
        let mut expected = vec![a.id(), b.id()];
        expected.sort_by_key(|p| p.to_string());
        assert_eq!(members, expected);
    }

    #[tokio::test]
    async fn closed_room_id_can_be_reused() {
        let registry = registry(None);
        let id = RoomId::parse("reuse").unwrap();
        registry.create_room(Some(id.clone())).await.unwrap();

        let room = registry.get(&id).await.unwrap();
        let (a, _rx) = peer();
        room.join(a.clone()).await.unwrap();
        // leave behind the registry's back: the entry is closed but present
        assert!(room.leave(a.id()).await);

        assert_eq!(registry.create_room(Some(id.clone())).await, Ok(id.clone()));
        assert!(!registry.get(&id).await.unwrap().is_closed().await);
    }

    #[tokio::test]
    async fn reap_removes_only_unclaimed_rooms() {
        let registry = registry(None);
        let idle = registry.create_room(None).await.unwrap();
        let busy = registry.create_room(None).await.unwrap();
        let (a, _rx) = peer();
        let _m = registry.join_room(&busy, a).await.unwrap();

        assert_eq!(registry.reap_unclaimed(Duration::from_secs(60)).await, 0);
        assert_eq!(registry.reap_unclaimed(Duration::ZERO).await, 1);
        assert!(registry.get(&idle).await.is_none());
        assert!(registry.get(&busy).await.is_some());
    }

    #[tokio::test]
    async fn join_after_reap_finds_no_room() {
        let registry = registry(None);
        let id = registry.create_room(None).await.unwrap();
        let (a, _rx) = peer();

        // the room was looked up just before the reaper ran
        let room = registry.get(&id).await.unwrap();
        assert_eq!(registry.reap_unclaimed(Duration::ZERO).await, 1);

        assert_eq!(
            room.join(a.clone()).await,
            Err(SignalingError::RoomNotFound(id.clone()))
        );
        assert!(room.is_empty().await);
        assert!(registry.get(&id).await.is_none());
        assert_eq!(a.room().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rooms_do_not_conflict_or_leak() {
        use crate::signaling::messages::{MessageKind, SignalingMessage};

        let registry = registry(None);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let id = RoomId::parse(&format!("room-{}", i)).unwrap();
                registry.create_room(Some(id.clone())).await.unwrap();

                let (a, _a_rx) = PeerConnection::new(PeerId::generate(), 64);
                let (b, mut b_rx) = PeerConnection::new(PeerId::generate(), 64);
                let ma = registry.join_room(&id, a.clone()).await.unwrap();
                let mb = registry.join_room(&id, b.clone()).await.unwrap();
                while b_rx.try_recv().is_ok() {}

                let room = registry.get(&id).await.unwrap();
                room.relay(&SignalingMessage {
                    kind: MessageKind::Offer,
                    sender_id: a.id(),
                    room_id: Some(id.clone()),
                    target_id: None,
                    payload: None,
                })
                .await
                .unwrap();

                let got: SignalingMessage =
                    serde_json::from_str(b_rx.recv().await.unwrap().as_str()).unwrap();
                assert_eq!(got.room_id, Some(id.clone()));
                assert_eq!(got.sender_id, a.id());
                assert!(b_rx.try_recv().is_err());
                (ma, mb)
            }));
        }

        let mut guards = Vec::new();
        for task in tasks {
            guards.push(task.await.unwrap());
        }
        assert_eq!(registry.room_count().await, 16);
    }
}
