use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Signaling broker errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("room is full: {0}")]
    RoomFull(RoomId),

    #[error("room id already taken: {0}")]
    RoomIdConflict(RoomId),

    #[error("peer {0} is already a member of a room")]
    AlreadyMember(PeerId),

    #[error("target peer {0} is not in this room")]
    UnknownTarget(PeerId),

    #[error("peer {0} is not in a room")]
    NotInRoom(PeerId),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Stable identifier used in error payloads and HTTP error bodies
    pub fn code(&self) -> &'static str {
        match self {
            SignalingError::RoomNotFound(_) => "room_not_found",
            SignalingError::RoomFull(_) => "room_full",
            SignalingError::RoomIdConflict(_) => "room_id_conflict",
            SignalingError::AlreadyMember(_) => "already_member",
            SignalingError::UnknownTarget(_) => "unknown_target",
            SignalingError::NotInRoom(_) => "not_in_room",
            SignalingError::ConnectionClosed => "connection_closed",
            SignalingError::MalformedMessage(_) => "malformed_message",
            SignalingError::Internal(_) => "internal",
        }
    }
}

const ROOM_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ROOM_ID_LEN: usize = 8;
const MAX_ROOM_ID_LEN: usize = 64;
const PEER_ID_PREFIX: &[u8] = b"peer_";
const PEER_ID_LEN: usize = 21;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Room identifier. Cheap to clone, shared between the registry and members.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(Arc<str>);

impl RoomId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id: String = (0..ROOM_ID_LEN)
            .map(|_| ROOM_ID_CHARS[rng.random_range(0..ROOM_ID_CHARS.len())] as char)
            .collect();
        Self(id.into())
    }

    /// Validate a client-supplied room id
    pub fn parse(s: &str) -> Result<Self, SignalingError> {
        if s.is_empty() || s.len() > MAX_ROOM_ID_LEN {
            return Err(SignalingError::MalformedMessage(format!(
                "room id must be 1 to {} characters",
                MAX_ROOM_ID_LEN
            )));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(SignalingError::MalformedMessage(format!(
                "room id contains invalid characters: {:?}",
                s
            )));
        }
        Ok(Self(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RoomId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Peer ID: 21-byte fixed array ("peer_" + 16 hex)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    bytes: [u8; PEER_ID_LEN],
}

static PEER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
static PEER_ID_SALT: OnceLock<u64> = OnceLock::new();

impl PeerId {
    /// Next process-unique id. A counter is scrambled with a per-process
    /// random salt; xor and multiplication by an odd constant are both
    /// bijections on u64, so distinct counter values never collide.
    pub fn generate() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);

        let salt = *PEER_ID_SALT.get_or_init(|| rand::rng().random());
        let n = PEER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let value = (n ^ salt).wrapping_mul(0x9E37_79B9_7F4A_7C15);

        for i in 0..16 {
            let nibble = ((value >> (60 - i * 4)) & 0xF) as usize;
            bytes[PEER_ID_PREFIX.len() + i] = HEX_CHARS[nibble];
        }
        Self { bytes }
    }

    /// Parse a peer id received on the wire. Only ids shaped like generated
    /// ones are accepted.
    pub fn parse(s: &str) -> Option<Self> {
        let src = s.as_bytes();
        if src.len() != PEER_ID_LEN || !src.starts_with(PEER_ID_PREFIX) {
            return None;
        }
        if !src[PEER_ID_PREFIX.len()..]
            .iter()
            .all(|b| HEX_CHARS.contains(b))
        {
            return None;
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(src);
        Some(Self { bytes })
    }

    pub fn as_str(&self) -> &str {
        // always ASCII: built from PEER_ID_PREFIX and HEX_CHARS
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid peer id: {:?}", s)))
    }
}

/// Encoded message ready for a peer's outbound channel.
/// Backed by `Arc<str>` so a fan-out encodes once and clones in O(1).
#[derive(Debug, Clone)]
pub struct OutboundMessage(Arc<str>);

impl OutboundMessage {
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owned text for a WebSocket text frame
    pub fn into_text(self) -> String {
        self.0.to_string()
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}
