use std::fmt;
use std::sync::Arc;

use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

use super::messages::ClientMessage;
use super::types::{OutboundMessage, PeerId, RoomId, SignalingError};

/// Frame delivered by a peer's transport, independent of the transport crate
#[derive(Debug)]
pub enum TransportFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// One message read from a peer, queued for the broadcaster
#[derive(Debug)]
pub struct Inbound {
    pub peer: Arc<PeerConnection>,
    pub message: Result<ClientMessage, SignalingError>,
}

/// One peer's session. Shared between the room it belongs to, the
/// broadcaster and the tasks driving its transport.
pub struct PeerConnection {
    id: PeerId,
    tx: mpsc::Sender<OutboundMessage>,
    room: Mutex<Option<RoomId>>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PeerConnection {
    /// Create a connection with an outbound buffer of `buffer` messages.
    /// The receiver half belongs to whoever writes to the transport.
    pub fn new(id: PeerId, buffer: usize) -> (Arc<Self>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (closed, _) = watch::channel(false);
        let peer = Arc::new(Self {
            id,
            tx,
            room: Mutex::new(None),
            closed,
        });
        (peer, rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub async fn room(&self) -> Option<RoomId> {
        self.room.lock().await.clone()
    }

    /// Bind this peer to `room` unless it already belongs to one
    pub(crate) async fn claim_room(&self, room: &RoomId) -> bool {
        let mut slot = self.room.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(room.clone());
        true
    }

    /// Clear the room slot if it still points at `room`
    pub(crate) async fn release_room(&self, room: &RoomId) {
        let mut slot = self.room.lock().await;
        if slot.as_ref() == Some(room) {
            *slot = None;
        }
    }

    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Queue a message without waiting. A full buffer means the peer is not
    /// draining: the connection is closed as stalled.
    pub fn send(&self, msg: OutboundMessage) -> Result<(), SignalingError> {
        if !self.is_alive() {
            return Err(SignalingError::ConnectionClosed);
        }
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Peer {} stalled, outbound buffer full", self.id);
                self.close();
                Err(SignalingError::ConnectionClosed)
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(SignalingError::ConnectionClosed)
            }
        }
    }

    /// Mark the connection closed. Returns `true` only for the call that
    /// performed the transition.
    pub fn close(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            debug!("Peer {} closed", self.id);
        }
        !was_closed
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Decode the transport's frames into inbound messages.
    ///
    /// The stream ends on a close frame, a transport error, the end of the
    /// underlying stream, or when [`PeerConnection::close`] is called.
    pub fn receive<S, E>(self: &Arc<Self>, frames: S) -> BoxStream<'static, Inbound>
    where
        S: Stream<Item = Result<TransportFrame, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let peer = Arc::clone(self);
        let watcher = Arc::clone(self);
        let id = self.id;

        frames
            .take_until(async move { watcher.closed().await })
            .map(move |frame| match frame {
                Ok(TransportFrame::Text(text)) => Some(ClientMessage::decode(&text)),
                Ok(TransportFrame::Binary(_)) => Some(Err(SignalingError::MalformedMessage(
                    "binary frames are not supported".to_string(),
                ))),
                Ok(TransportFrame::Close) => None,
                Err(e) => {
                    debug!("Transport error from {}: {}", id, e);
                    None
                }
            })
            .take_while(|decoded| futures_util::future::ready(decoded.is_some()))
            .filter_map(move |decoded| {
                let peer = Arc::clone(&peer);
                futures_util::future::ready(decoded.map(|message| Inbound { peer, message }))
            })
            .boxed()
    }
}
