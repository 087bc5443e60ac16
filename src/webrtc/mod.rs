//! Media negotiation
//!
//! This module provides:
//! - The negotiation adapter and the engine contract it wraps
//! - A webrtc-rs backed engine
//! - Local media source management

pub mod media;
pub mod negotiation;
#[cfg(feature = "webrtc-engine")]
pub mod peer_connection;

#[cfg(test)]
pub(crate) mod testing;

pub use media::{LocalMediaManager, MediaKind, MediaSourceHandle};
pub use negotiation::{
    EngineEvent, EngineEvents, IceCandidate, NegotiationAdapter, NegotiationEngine,
    SessionDescription,
};

#[cfg(feature = "webrtc-engine")]
pub use peer_connection::RtcEngine;
