//! Wire messages: the envelope every frame carries, plus control payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::NodeId;

/// Hop budget stamped on a message when the sender does not choose one.
pub const DEFAULT_TTL: u32 = 3;

/// The verb of a message.
///
/// The first five kinds are control verbs handled by the node itself. All
/// other kinds are application verbs: they are flooded across the mesh and
/// delivered to registered handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    // ── Control ─────────────────────────────────────────────────────
    /// Session opener, sent by the dialing side.
    Hello,
    /// Reply to Hello.
    HelloAck,
    /// Keep-alive ping.
    Heartbeat,
    /// Keep-alive pong.
    HeartbeatAck,
    /// Online peers known to the sender.
    PeerList,

    // ── Replication ─────────────────────────────────────────────────
    /// Ask the mesh for a snapshot.
    SyncRequest,
    /// A serialized snapshot.
    SyncPackage,

    // ── Extensible ──────────────────────────────────────────────────
    /// Any other application verb.
    Custom(String),
}

impl MessageKind {
    /// The verb as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Hello => "HELLO",
            Self::HelloAck => "HELLO_ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
            Self::PeerList => "PEER_LIST",
            Self::SyncRequest => "SYNC_REQUEST",
            Self::SyncPackage => "SYNC_PACKAGE",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "HELLO" => Self::Hello,
            "HELLO_ACK" => Self::HelloAck,
            "HEARTBEAT" => Self::Heartbeat,
            "HEARTBEAT_ACK" => Self::HeartbeatAck,
            "PEER_LIST" => Self::PeerList,
            "SYNC_REQUEST" => Self::SyncRequest,
            "SYNC_PACKAGE" => Self::SyncPackage,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The verb.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// The node that originated the message. Not rewritten when forwarded.
    pub from_node_id: NodeId,
    /// Unique per originating send; used for dedup.
    pub message_id: Uuid,
    /// Opaque payload, JSON text for every built-in verb.
    pub payload: String,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Remaining forwards.
    pub ttl: u32,
}

impl Envelope {
    /// Create a new envelope with a fresh message id and the default ttl.
    pub fn new(from: NodeId, kind: impl Into<MessageKind>, payload: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            from_node_id: from,
            message_id: Uuid::new_v4(),
            payload: payload.into(),
            timestamp: Utc::now(),
            ttl: DEFAULT_TTL,
        }
    }

    /// Create an envelope whose payload is `payload` encoded as JSON.
    pub fn with_json<T: Serialize>(
        from: NodeId,
        kind: impl Into<MessageKind>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(from, kind, serde_json::to_string(payload)?))
    }

    /// Set the hop budget.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Decode the payload as JSON.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// Serialize the envelope to JSON bytes for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize an envelope from JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ---------------------------------------------------------------------------
// Control payloads
// ---------------------------------------------------------------------------

/// Payload of HELLO and HELLO_ACK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub endpoint: String,
}

/// One entry of a PEER_LIST payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEndpoint {
    pub node_id: NodeId,
    pub endpoint: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_defaults() {
        let from = NodeId::generate();
        let env = Envelope::new(from, MessageKind::Heartbeat, "");
        assert_eq!(env.from_node_id, from);
        assert_eq!(env.ttl, DEFAULT_TTL);
        assert_ne!(env.message_id, Envelope::new(from, "X", "").message_id);
    }

    #[test]
    fn test_wire_field_names() {
        let env = Envelope::new(NodeId::generate(), MessageKind::HelloAck, "{}").with_ttl(0);
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(value["type"], "HELLO_ACK");
        assert_eq!(value["ttl"], 0);
        assert!(value.get("fromNodeId").is_some());
        assert!(value.get("messageId").is_some());
        assert!(value.get("payload").is_some());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn test_kind_string_mapping() {
        let kinds = [
            MessageKind::Hello,
            MessageKind::HelloAck,
            MessageKind::Heartbeat,
            MessageKind::HeartbeatAck,
            MessageKind::PeerList,
            MessageKind::SyncRequest,
            MessageKind::SyncPackage,
            MessageKind::Custom("ORDER_PLACED".to_string()),
        ];
        for kind in kinds {
            let wire: String = kind.clone().into();
            assert_eq!(MessageKind::from(wire), kind);
        }
    }

    #[test]
    fn test_json_payload() {
        let payload = HelloPayload {
            endpoint: "127.0.0.1:5001".to_string(),
        };
        let env = Envelope::with_json(NodeId::generate(), MessageKind::Hello, &payload).unwrap();
        assert_eq!(env.payload, r#"{"endpoint":"127.0.0.1:5001"}"#);
        assert_eq!(env.parse_payload::<HelloPayload>().unwrap(), payload);
    }

    #[test]
    fn test_peer_list_payload_shape() {
        let id = NodeId::generate();
        let list = vec![PeerEndpoint {
            node_id: id,
            endpoint: "10.1.1.1:7000".to_string(),
        }];
        let json = serde_json::to_string(&list).unwrap();
        assert_eq!(
            json,
            format!(r#"[{{"nodeId":"{id}","endpoint":"10.1.1.1:7000"}}]"#)
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Envelope::from_slice(b"{\"type\":\"HELLO\"").is_err());
        assert!(Envelope::from_slice(b"hello").is_err());
    }
}
