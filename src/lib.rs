//! rtsp-peer - WebRTC signaling session core
//!
//! Pairs this endpoint with a remote peer through a WebSocket signaling
//! server, negotiates a media session over offer/answer and trickled ICE
//! candidates, and tears everything down when either side ends it.

pub mod config;
pub mod error;
pub mod session;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use error::{EngineError, SessionError};
pub use session::{
    EndReason, PeerIdentity, Role, SessionDriver, SessionHandle, SessionNotification,
    SessionPhase,
};
pub use transport::{MessageCodec, SignalingChannel, SignalingMessage};
