use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::types::{OutboundMessage, PeerId, RoomId, SignalingError};

/// Kind of a signaling envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
    Join,
    Leave,
    Error,
}

impl MessageKind {
    /// Offer, answer and candidate messages are relayed between peers
    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            MessageKind::Offer | MessageKind::Answer | MessageKind::Candidate
        )
    }
}

/// Envelope delivered to peers.
///
/// `payload` is kept as raw JSON and written back out unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub kind: MessageKind,

    #[serde(rename = "senderID")]
    pub sender_id: PeerId,

    #[serde(rename = "roomID", default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,

    #[serde(rename = "targetID", default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<PeerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

/// Payload of the acknowledgement a peer receives after joining
#[derive(Debug, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub peers: Vec<PeerId>,
}

/// Payload of an `error` message
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl SignalingMessage {
    /// Tells existing members that `peer` arrived
    pub fn join_notification(peer: PeerId, room: &RoomId) -> Self {
        Self {
            kind: MessageKind::Join,
            sender_id: peer,
            room_id: Some(room.clone()),
            target_id: None,
            payload: None,
        }
    }

    /// Sent to a newly admitted peer: its own id plus the members already present
    pub fn join_ack(
        peer: PeerId,
        room: &RoomId,
        peers: Vec<PeerId>,
    ) -> Result<Self, SignalingError> {
        Ok(Self {
            kind: MessageKind::Join,
            sender_id: peer,
            room_id: Some(room.clone()),
            target_id: Some(peer),
            payload: Some(to_raw(&RoomSnapshot { peers })?),
        })
    }

    pub fn leave_notification(peer: PeerId, room: &RoomId) -> Self {
        Self {
            kind: MessageKind::Leave,
            sender_id: peer,
            room_id: Some(room.clone()),
            target_id: None,
            payload: None,
        }
    }

    /// Error report addressed back to the peer whose message failed
    pub fn error(
        peer: PeerId,
        room: Option<RoomId>,
        err: &SignalingError,
    ) -> Result<Self, SignalingError> {
        let payload = ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
        };
        Ok(Self {
            kind: MessageKind::Error,
            sender_id: peer,
            room_id: room,
            target_id: Some(peer),
            payload: Some(to_raw(&payload)?),
        })
    }

    pub fn encode(&self) -> Result<OutboundMessage, SignalingError> {
        serde_json::to_string(self)
            .map(OutboundMessage::from)
            .map_err(|e| SignalingError::Internal(format!("encode failed: {}", e)))
    }
}

fn to_raw<T: Serialize>(value: &T) -> Result<Box<RawValue>, SignalingError> {
    serde_json::value::to_raw_value(value)
        .map_err(|e| SignalingError::Internal(format!("encode failed: {}", e)))
}

/// Envelope as sent by a peer. The broker fills in sender and room itself,
/// so both are optional here.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub kind: MessageKind,

    #[serde(rename = "senderID", default)]
    pub sender_id: Option<PeerId>,

    #[serde(rename = "roomID", default)]
    pub room_id: Option<RoomId>,

    #[serde(rename = "targetID", default)]
    pub target_id: Option<PeerId>,

    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text)
            .map_err(|e| SignalingError::MalformedMessage(format!("invalid message: {}", e)))
    }
}
