//! Error taxonomy for the signaling session core

use thiserror::Error;

/// Errors raised while driving a signaling session.
///
/// `MalformedMessage` and `InvalidState` are recoverable: the offending
/// message is logged and dropped. `NegotiationFailure` and `ChannelClosed`
/// always end the session. `DeviceUnavailable` only concerns local media
/// acquisition and never affects a running session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Wire bytes are not a valid signaling message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    /// Operation attempted outside its valid phase
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// The negotiation engine rejected an offer, answer or candidate
    #[error("Negotiation failure: {0}")]
    NegotiationFailure(String),
    /// Signaling channel is gone
    #[error("Signaling channel closed")]
    ChannelClosed,
    /// Local capture device could not be opened
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Failure reported by a negotiation engine implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        EngineError(message.into())
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        SessionError::NegotiationFailure(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_maps_to_negotiation_failure() {
        let err: SessionError = EngineError::new("bad sdp").into();
        assert_eq!(err, SessionError::NegotiationFailure("bad sdp".to_string()));
    }
}
