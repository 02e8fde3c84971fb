//! Room and broadcast engine for WebRTC signaling, plus its WebSocket gateway

mod broadcaster;
mod messages;
mod peer;
mod registry;
mod room;
mod server;
mod types;

pub use broadcaster::{Broadcaster, BroadcasterHandle};
pub use messages::{ClientMessage, ErrorPayload, MessageKind, RoomSnapshot, SignalingMessage};
pub use peer::{Inbound, PeerConnection, TransportFrame};
pub use registry::{Membership, RoomRegistry};
pub use room::{RelayOutcome, Room};
pub use server::SignalingServer;
pub use types::{OutboundMessage, PeerId, RoomId, SignalingError};
