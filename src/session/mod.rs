//! Signaling session core
//!
//! This module provides:
//! - The session data model (peer identity, phases, roles)
//! - The candidate buffer used before a remote description exists
//! - The session state machine
//! - The serialized event loop that drives it

pub mod candidates;
pub mod driver;
pub mod machine;

pub use candidates::CandidateBuffer;
pub use driver::{event_queue, EventReceiver, EventSender, SessionDriver, SessionHandle};
pub use machine::{OperationOutcome, SessionMachine};

use crate::config::SessionConfig;
use crate::webrtc::media::{MediaKind, MediaSourceHandle};
use crate::webrtc::negotiation::{EngineEvent, OfferConstraints};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque short code identifying one endpoint to the signaling server.
///
/// Codes are 4-digit decimal strings so the `peerId` string form used by
/// `CONNECT` and the numeric `targetId` form used by `SESSION` agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(code: impl Into<String>) -> Self {
        PeerIdentity(code.into())
    }

    /// Generate a random identity in the range 1000..=9999
    pub fn generate() -> Self {
        let code: u16 = rand::thread_rng().gen_range(1000..=9999);
        PeerIdentity(code.to_string())
    }

    pub fn from_number(id: u64) -> Self {
        PeerIdentity(id.to_string())
    }

    /// Numeric form, if the code is purely decimal
    pub fn as_number(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Nothing happened yet
    Idle,
    /// CONNECT sent, awaiting CONNECT_OK
    Connecting,
    /// Registered with the signaling server
    Registered,
    /// Session requested or offered, awaiting SESSION_OK
    AwaitingPeer,
    /// Paired, offer/answer exchange in progress
    Negotiating,
    /// Media engine reports connected
    Active,
    /// Terminal
    Ended,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Registered => "registered",
            SessionPhase::AwaitingPeer => "awaiting-peer",
            SessionPhase::Negotiating => "negotiating",
            SessionPhase::Active => "active",
            SessionPhase::Ended => "ended",
        }
    }

    /// A remote peer exists to receive candidates
    pub fn is_paired(&self) -> bool {
        matches!(self, SessionPhase::Negotiating | SessionPhase::Active)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation role, assigned once when pairing completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the offer
    Initiator,
    /// Awaits the offer and answers it
    Responder,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// The live description of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub local_peer: PeerIdentity,
    pub remote_peer: Option<PeerIdentity>,
    /// Set once on entering `Negotiating`, never changed afterwards
    pub role: Option<Role>,
    pub phase: SessionPhase,
}

impl SessionDescriptor {
    pub fn new(local_peer: PeerIdentity) -> Self {
        Self {
            local_peer,
            remote_peer: None,
            role: None,
            phase: SessionPhase::Idle,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Remote sent SESSION_END
    Remote,
    /// Remote or server sent SESSION_ERROR
    RemoteError(Option<String>),
    /// Signaling channel was lost
    ChannelClosed,
    /// Local user cancelled
    Cancelled,
    /// Media engine rejected an operation or the connection failed
    NegotiationFailed(String),
    /// No progress within the configured idle timeout
    IdleTimeout,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Remote => write!(f, "ended by remote peer"),
            EndReason::RemoteError(Some(reason)) => write!(f, "remote error: {}", reason),
            EndReason::RemoteError(None) => write!(f, "remote error"),
            EndReason::ChannelClosed => write!(f, "signaling channel closed"),
            EndReason::Cancelled => write!(f, "cancelled"),
            EndReason::NegotiationFailed(reason) => write!(f, "negotiation failed: {}", reason),
            EndReason::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// Notifications delivered to the session observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotification {
    /// Entered a non-terminal phase
    PhaseChanged { phase: SessionPhase },
    /// Remote media of this kind is available (at most once per kind)
    RemoteStream { kind: MediaKind },
    /// Local media was attached after negotiation began; a new offer/answer
    /// round is owed but is not started automatically
    RenegotiationNeeded,
    /// Attaching local media to the engine failed; the session continues
    LocalMediaRejected { reason: String },
    /// Terminal notification, delivered exactly once
    Ended { reason: EndReason },
}

/// Local user intents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    RequestSession { target: PeerIdentity },
    AttachMedia(MediaSourceHandle),
    /// Withdraw previously attached local media from the engine
    DetachMedia(MediaSourceHandle),
    Cancel,
}

/// Everything the state machine consumes, serialized onto one queue
#[derive(Debug)]
pub enum SessionEvent {
    ChannelOpened,
    ChannelMessage(String),
    ChannelClosed,
    Engine(EngineEvent),
    Command(UserCommand),
    /// An asynchronous negotiation operation finished
    OperationComplete { epoch: u64, outcome: OperationOutcome },
    /// An idle timer armed under `generation` fired
    IdleTimeout { generation: u64 },
}

/// Session policy knobs
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Maximum time spent in `AwaitingPeer` or `Negotiating`
    pub idle_timeout: Option<Duration>,
    /// Refuse to create an offer without attached local media
    pub require_local_media: bool,
    /// Role taken by the requesting side when SESSION_OK names none
    pub requester_role: Role,
    pub offer_constraints: OfferConstraints,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(30)),
            require_local_media: false,
            requester_role: Role::Initiator,
            offer_constraints: OfferConstraints::default(),
        }
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            idle_timeout: match config.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            require_local_media: config.require_local_media,
            requester_role: config.requester_role,
            offer_constraints: OfferConstraints::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_is_four_digits() {
        for _ in 0..32 {
            let id = PeerIdentity::generate();
            assert_eq!(id.as_str().len(), 4);
            let n = id.as_number().expect("numeric");
            assert!((1000..=9999).contains(&n));
        }
    }

    #[test]
    fn identity_number_round_trip() {
        let id = PeerIdentity::from_number(4821);
        assert_eq!(id.as_str(), "4821");
        assert_eq!(id.as_number(), Some(4821));
        assert_eq!(PeerIdentity::new("ab12").as_number(), None);
    }

    #[test]
    fn paired_phases() {
        assert!(SessionPhase::Negotiating.is_paired());
        assert!(SessionPhase::Active.is_paired());
        assert!(!SessionPhase::AwaitingPeer.is_paired());
        assert!(!SessionPhase::Ended.is_paired());
    }

    #[test]
    fn settings_from_config() {
        let mut config = SessionConfig::default();
        config.idle_timeout_secs = 0;
        config.requester_role = Role::Responder;
        let settings = SessionSettings::from(&config);
        assert_eq!(settings.idle_timeout, None);
        assert_eq!(settings.requester_role, Role::Responder);
    }
}
