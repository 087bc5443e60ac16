//! Transport layer for the signaling session
//!
//! Handles the signaling wire format, the WebSocket control connection and
//! the HTTP session bootstrap request.

pub mod bootstrap;
pub mod channel;
pub mod codec;

pub use bootstrap::{BootstrapClient, TransformMethod};
pub use channel::{LoopbackPeer, SignalingChannel};
pub use codec::{MessageCodec, SignalingMessage};
