//! Signaling message codec
//!
//! Every message travels as one JSON object:
//! `{"type": "<TYPE>", "data": { ...fields per type } }`.

use crate::error::SessionError;
use crate::session::Role;
use crate::webrtc::negotiation::IceCandidate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Typed signaling message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalingMessage {
    /// Register with the signaling server
    Connect {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Registration accepted
    ConnectOk {},
    /// Request a session with `target_id`, or notify the target of one
    Session {
        #[serde(rename = "targetId")]
        target_id: u64,
    },
    /// Pairing complete. The server may assign the negotiation role and name
    /// the remote peer.
    SessionOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    SessionEnd {},
    SessionError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    OfferSdp { sdp: String },
    AnswerSdp { sdp: String },
    OnIceCandidate { candidate: IceCandidate },
}

impl SignalingMessage {
    /// Wire type tag, for logging
    pub fn name(&self) -> &'static str {
        match self {
            SignalingMessage::Connect { .. } => "CONNECT",
            SignalingMessage::ConnectOk {} => "CONNECT_OK",
            SignalingMessage::Session { .. } => "SESSION",
            SignalingMessage::SessionOk { .. } => "SESSION_OK",
            SignalingMessage::SessionEnd {} => "SESSION_END",
            SignalingMessage::SessionError { .. } => "SESSION_ERROR",
            SignalingMessage::OfferSdp { .. } => "OFFER_SDP",
            SignalingMessage::AnswerSdp { .. } => "ANSWER_SDP",
            SignalingMessage::OnIceCandidate { .. } => "ON_ICE_CANDIDATE",
        }
    }

    pub fn connect(peer_id: &str) -> Self {
        SignalingMessage::Connect {
            peer_id: peer_id.to_string(),
        }
    }

    pub fn session_error(reason: impl Into<String>) -> Self {
        SignalingMessage::SessionError {
            reason: Some(reason.into()),
        }
    }
}

/// Stateless signaling codec
pub struct MessageCodec;

impl MessageCodec {
    /// Serialize a message to its wire text
    pub fn encode(message: &SignalingMessage) -> String {
        serde_json::to_string(message).unwrap_or_default()
    }

    /// Parse wire text into a typed message.
    ///
    /// A missing or null `data` is read as an empty object, so payloads
    /// whose fields are all optional decode either way.
    pub fn decode(text: &str) -> Result<SignalingMessage, SessionError> {
        let mut value: Value = serde_json::from_str(text)
            .map_err(|e| SessionError::MalformedMessage(format!("not a signaling object: {}", e)))?;

        if let Value::Object(ref mut envelope) = value {
            if envelope.get("data").map_or(true, Value::is_null) {
                envelope.insert("data".to_string(), Value::Object(Map::new()));
            }
        }

        serde_json::from_value(value)
            .map_err(|e| SessionError::MalformedMessage(format!("bad signaling message: {}", e)))
    }
}
