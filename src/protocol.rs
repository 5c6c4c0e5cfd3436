//! Wire protocol for the relay server.
//!
//! Event names and payload field names must match the server exactly; the
//! server side predates this client and speaks Spanish for the room and
//! broadcast verbs (`unirse`, `identificar`, `notificar`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application-level acknowledgment sent by the server once the session is
/// authenticated. Promotes the connection from Connected to Ready.
pub const EVENT_CONNECTED: &str = "connected";

/// Server-pushed system events, forwarded verbatim to subscribers.
pub const EVENT_SYSTEM: &str = "system";

/// Join a logical room. Acked with `{ success, message? }`.
pub const EVENT_JOIN_ROOM: &str = "unirse";

/// Bind the session to a user id. Acked with `{ success }`.
pub const EVENT_IDENTIFY: &str = "identificar";

/// Scoped notification broadcast (fire-and-forget).
pub const EVENT_NOTIFY: &str = "notificar";

/// Scoped message broadcast (fire-and-forget).
pub const EVENT_RELAY: &str = "relay";

/// Server-side rejection of a connection attempt, e.g. a bad credential.
pub const EVENT_CONNECT_ERROR: &str = "connect_error";

/// Handshake frame sent by the default transport right after the socket opens.
pub const EVENT_AUTH: &str = "auth";

/// Server acknowledgment frame for an `ack`-carrying emit.
pub const EVENT_ACK: &str = "ack";

/// JSON envelope for frames on the default WebSocket transport.
///
/// Outbound emits that expect a server acknowledgment carry a numeric `ack`
/// id; the server replies with an [`EVENT_ACK`] envelope echoing the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Acknowledgment correlation id, when the sender expects a reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    /// Opaque event payload.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Build a fire-and-forget envelope.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            ack: None,
            data,
        }
    }

    /// Build an envelope that requests a server acknowledgment.
    pub fn with_ack(event: impl Into<String>, data: Value, ack: u64) -> Self {
        Self {
            event: event.into(),
            ack: Some(ack),
            data,
        }
    }
}

/// Payload of the server's [`EVENT_CONNECTED`] acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    /// Server-assigned session identifier.
    pub session_id: String,
    /// Principal the server resolved from the credential, if any.
    #[serde(default)]
    pub principal_id: Option<String>,
}

/// Normalized server acknowledgment for join-room and identify operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    /// Whether the server accepted the operation.
    pub success: bool,
    /// Human-readable detail, present on failure and sometimes on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AckResponse {
    /// A successful acknowledgment with no message.
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    /// A failure acknowledgment carrying a human-readable message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }

    /// Normalize a raw ack payload into an [`AckResponse`].
    ///
    /// Accepts the `{ success, message? }` shape; anything that does not parse
    /// (including a transport error object in place of a payload) maps to a
    /// failure so callers always receive a terminal, well-formed response.
    pub fn from_payload(payload: Value) -> Self {
        match serde_json::from_value::<AckResponse>(payload) {
            Ok(ack) => ack,
            Err(e) => Self::failure(format!("Malformed server acknowledgment: {}", e)),
        }
    }
}

/// Target audience of a broadcast.
///
/// The room variant carries its identifier, so a room-scoped broadcast without
/// a room id cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastScope {
    /// Only the sending session.
    Me,
    /// Every session except the sender.
    Others,
    /// Every session including the sender.
    Everyone,
    /// All sessions joined to the given room.
    Room(String),
}

impl BroadcastScope {
    /// Wire value for the `destino` field.
    pub fn destino(&self) -> &'static str {
        match self {
            BroadcastScope::Me => "yo",
            BroadcastScope::Others => "ustedes",
            BroadcastScope::Everyone => "nosotros",
            BroadcastScope::Room(_) => "room",
        }
    }

    /// Shape the broadcast payload for [`EVENT_NOTIFY`] / [`EVENT_RELAY`].
    pub fn shape_payload(&self, data: Value) -> Value {
        let mut payload = serde_json::json!({
            "data": data,
            "destino": self.destino(),
        });
        if let BroadcastScope::Room(room) = self {
            payload["room"] = Value::String(room.clone());
        }
        payload
    }
}

/// Payload for a join-room emit.
pub fn join_room_payload(room: &str) -> Value {
    serde_json::json!({ "room": room })
}

/// Payload for an identify emit.
pub fn identify_payload(user_id: &str) -> Value {
    serde_json::json!({ "userId": user_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::with_ack(EVENT_JOIN_ROOM, join_room_payload("court-5"), 7);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "unirse",
                "ack": 7,
                "data": { "room": "court-5" },
            })
        );
    }

    #[test]
    fn test_envelope_omits_absent_ack() {
        let env = Envelope::new(EVENT_NOTIFY, Value::Null);
        let text = serde_json::to_string(&env).unwrap();
        assert!(!text.contains("ack"));
    }

    #[test]
    fn test_connected_info_field_names() {
        let info: ConnectedInfo =
            serde_json::from_str(r#"{"sessionId":"s1","principalId":null}"#).unwrap();
        assert_eq!(info.session_id, "s1");
        assert!(info.principal_id.is_none());
    }

    #[test]
    fn test_identify_payload_is_camel_case() {
        assert_eq!(
            identify_payload("u-9"),
            serde_json::json!({ "userId": "u-9" })
        );
    }

    #[test]
    fn test_ack_normalization() {
        let ok = AckResponse::from_payload(serde_json::json!({ "success": true }));
        assert!(ok.success);
        assert!(ok.message.is_none());

        let rejected = AckResponse::from_payload(
            serde_json::json!({ "success": false, "message": "room full" }),
        );
        assert!(!rejected.success);
        assert_eq!(rejected.message.as_deref(), Some("room full"));

        // An error object in place of a payload normalizes to a failure.
        let garbled = AckResponse::from_payload(serde_json::json!({ "error": "boom" }));
        assert!(!garbled.success);
        assert!(garbled.message.is_some());
    }

    #[test]
    fn test_scope_destino_values() {
        assert_eq!(BroadcastScope::Me.destino(), "yo");
        assert_eq!(BroadcastScope::Others.destino(), "ustedes");
        assert_eq!(BroadcastScope::Everyone.destino(), "nosotros");
        assert_eq!(BroadcastScope::Room("r".into()).destino(), "room");
    }

    #[test]
    fn test_scope_payload_shaping() {
        let scoped = BroadcastScope::Room("court-5".into())
            .shape_payload(serde_json::json!({ "kind": "booking" }));
        assert_eq!(
            scoped,
            serde_json::json!({
                "data": { "kind": "booking" },
                "destino": "room",
                "room": "court-5",
            })
        );

        let broadcast = BroadcastScope::Everyone.shape_payload(Value::Null);
        assert!(broadcast.get("room").is_none());
    }
}
