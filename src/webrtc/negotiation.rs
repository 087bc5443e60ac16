//! Negotiation adapter
//!
//! Thin contract over a media-negotiation engine. The adapter tracks the
//! offer/answer state the engine is in and refuses operations that make no
//! sense in that state, so the session state machine never has to trust the
//! engine to reject them.

use super::media::{MediaKind, MediaSourceHandle};
use crate::error::{EngineError, SessionError};
use crate::session::{EventSender, SessionEvent};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// An SDP blob tagged with its role in the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate descriptor, in the browser's `RTCIceCandidateInit` shape.
///
/// Fields the engine does not know about are kept in `extra` and relayed
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
            extra: Map::new(),
        }
    }
}

/// Which remote media kinds an offer/answer asks to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for OfferConstraints {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

/// Media transport connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous engine notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local network path was discovered
    LocalCandidate(IceCandidate),
    /// Remote media of this kind arrived
    RemoteTrack(MediaKind),
    ConnectionState(ConnectionState),
}

/// Sink through which an engine reports its callbacks.
///
/// Events land on the session's serialized queue. Once disarmed (on
/// `close()`), every later emit is swallowed.
#[derive(Clone)]
pub struct EngineEvents {
    tx: EventSender,
    armed: Arc<AtomicBool>,
}

impl EngineEvents {
    pub fn new(tx: EventSender) -> Self {
        Self {
            tx,
            armed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns false when the event was suppressed or nobody is listening
    pub fn emit(&self, event: EngineEvent) -> bool {
        if !self.armed.load(Ordering::Acquire) {
            debug!("Suppressing engine event after close: {:?}", event);
            return false;
        }
        self.tx.send(SessionEvent::Engine(event)).is_ok()
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

/// Operations a media-negotiation engine must provide.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Register the sink for candidate, track and connection-state callbacks
    fn subscribe(&self, events: EngineEvents);

    async fn create_offer(&self, constraints: OfferConstraints) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self, constraints: OfferConstraints) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Attach a local capture source's tracks
    async fn add_local_media(&self, source: &MediaSourceHandle) -> Result<(), EngineError>;

    /// Withdraw the tracks previously added for `source`
    async fn remove_local_media(&self, source: &MediaSourceHandle) -> Result<(), EngineError>;

    /// Release every engine resource
    async fn close(&self) -> Result<(), EngineError>;
}

/// Offer/answer state of the engine, as tracked by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug)]
struct AdapterState {
    signaling: SignalingState,
    remote_description_set: bool,
    local_media: Vec<MediaSourceHandle>,
}

/// Owned handle to one negotiation engine instance
pub struct NegotiationAdapter {
    engine: Arc<dyn NegotiationEngine>,
    events: EngineEvents,
    require_local_media: bool,
    state: Mutex<AdapterState>,
}

impl NegotiationAdapter {
    pub fn new(engine: Arc<dyn NegotiationEngine>, events: EngineEvents, require_local_media: bool) -> Self {
        engine.subscribe(events.clone());
        Self {
            engine,
            events,
            require_local_media,
            state: Mutex::new(AdapterState {
                signaling: SignalingState::Stable,
                remote_description_set: false,
                local_media: Vec::new(),
            }),
        }
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description_set
    }

    pub fn has_local_media(&self) -> bool {
        !self.state.lock().local_media.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.signaling_state() == SignalingState::Closed
    }

    fn expect_state(&self, expected: SignalingState, operation: &str) -> Result<(), SessionError> {
        let current = self.signaling_state();
        if current == SignalingState::Closed {
            return Err(SessionError::InvalidState(format!("{} after close", operation)));
        }
        if current != expected {
            return Err(SessionError::InvalidState(format!(
                "{} not allowed in {:?}",
                operation, current
            )));
        }
        Ok(())
    }

    pub async fn create_offer(&self, constraints: OfferConstraints) -> Result<SessionDescription, SessionError> {
        self.expect_state(SignalingState::Stable, "create_offer")?;
        if self.require_local_media && !self.has_local_media() {
            return Err(SessionError::NegotiationFailure(
                "no local media source attached".to_string(),
            ));
        }
        Ok(self.engine.create_offer(constraints).await?)
    }

    pub async fn create_answer(&self, constraints: OfferConstraints) -> Result<SessionDescription, SessionError> {
        self.expect_state(SignalingState::HaveRemoteOffer, "create_answer")?;
        Ok(self.engine.create_answer(constraints).await?)
    }

    pub async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        let next = match desc.kind {
            SdpKind::Offer => {
                self.expect_state(SignalingState::Stable, "set_local_description(offer)")?;
                SignalingState::HaveLocalOffer
            }
            SdpKind::Answer => {
                self.expect_state(SignalingState::HaveRemoteOffer, "set_local_description(answer)")?;
                SignalingState::Stable
            }
        };
        self.engine.set_local_description(desc).await?;
        self.transition(next);
        Ok(())
    }

    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        let next = match desc.kind {
            SdpKind::Offer => {
                self.expect_state(SignalingState::Stable, "set_remote_description(offer)")?;
                SignalingState::HaveRemoteOffer
            }
            SdpKind::Answer => {
                self.expect_state(SignalingState::HaveLocalOffer, "set_remote_description(answer)")?;
                SignalingState::Stable
            }
        };
        self.engine.set_remote_description(desc).await?;
        let mut state = self.state.lock();
        if state.signaling != SignalingState::Closed {
            state.signaling = next;
            state.remote_description_set = true;
        }
        Ok(())
    }

    /// Fails with `InvalidState` until a remote description is set; callers
    /// buffer and retry.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::InvalidState("add_remote_candidate after close".to_string()));
        }
        if !self.has_remote_description() {
            return Err(SessionError::InvalidState(
                "remote candidate before remote description".to_string(),
            ));
        }
        Ok(self.engine.add_remote_candidate(candidate).await?)
    }

    pub async fn attach_local_media(&self, source: MediaSourceHandle) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::InvalidState("attach_local_media after close".to_string()));
        }
        self.engine.add_local_media(&source).await?;
        self.state.lock().local_media.push(source);
        Ok(())
    }

    pub async fn detach_local_media(&self, source: &MediaSourceHandle) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::InvalidState("detach_local_media after close".to_string()));
        }
        if !self.state.lock().local_media.contains(source) {
            return Err(SessionError::InvalidState(format!(
                "media source {} is not attached",
                source.id
            )));
        }
        self.engine.remove_local_media(source).await?;
        self.state.lock().local_media.retain(|attached| attached != source);
        Ok(())
    }

    fn transition(&self, next: SignalingState) {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::Closed {
            state.signaling = next;
        }
    }

    /// Mark closed and stop event delivery. Returns true only the first time.
    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return false;
        }
        state.signaling = SignalingState::Closed;
        state.local_media.clear();
        drop(state);
        self.events.disarm();
        true
    }

    /// Release the engine. Idempotent; returns whether this call released it.
    pub async fn close(&self) -> bool {
        if !self.mark_closed() {
            return false;
        }
        if let Err(e) = self.engine.close().await {
            warn!("Negotiation engine close failed: {}", e);
        }
        info!("Negotiation engine released");
        true
    }

    /// Non-blocking close: callbacks stop immediately, the engine itself is
    /// released on a background task.
    pub fn shutdown(self: &Arc<Self>) -> bool {
        if !self.mark_closed() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to release the negotiation engine on");
            return true;
        };
        let engine = self.engine.clone();
        runtime.spawn(async move {
            if let Err(e) = engine.close().await {
                warn!("Negotiation engine close failed: {}", e);
            }
            info!("Negotiation engine released");
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::event_queue;
    use crate::webrtc::testing::{EngineCall, ScriptedEngine};

    fn adapter(require_media: bool) -> (Arc<ScriptedEngine>, NegotiationAdapter, crate::session::EventReceiver) {
        let engine = ScriptedEngine::new();
        let (tx, rx) = event_queue();
        let adapter = NegotiationAdapter::new(engine.clone(), EngineEvents::new(tx), require_media);
        (engine, adapter, rx)
    }

    #[tokio::test]
    async fn offer_then_answer_returns_to_stable() {
        let (engine, adapter, _rx) = adapter(false);
        let offer = adapter.create_offer(OfferConstraints::default()).await.expect("offer");
        adapter.set_local_description(offer).await.expect("set local");
        assert_eq!(adapter.signaling_state(), SignalingState::HaveLocalOffer);

        adapter
            .set_remote_description(SessionDescription::answer("v=0 remote"))
            .await
            .expect("set remote");
        assert_eq!(adapter.signaling_state(), SignalingState::Stable);
        assert!(adapter.has_remote_description());
        assert_eq!(engine.calls().len(), 3);
    }

    #[tokio::test]
    async fn answer_without_offer_is_invalid_state() {
        let (engine, adapter, _rx) = adapter(false);
        let err = adapter
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        let err = adapter.create_answer(OfferConstraints::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn candidate_before_remote_description_is_refused() {
        let (engine, adapter, _rx) = adapter(false);
        let err = adapter
            .add_remote_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));

        adapter
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .expect("set remote");
        adapter
            .add_remote_candidate(IceCandidate::new("candidate:1"))
            .await
            .expect("add candidate");
        assert_eq!(
            engine.calls().last(),
            Some(&EngineCall::AddCandidate("candidate:1".to_string()))
        );
    }

    #[tokio::test]
    async fn offer_requires_media_when_configured() {
        let (engine, adapter, _rx) = adapter(true);
        let err = adapter.create_offer(OfferConstraints::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::NegotiationFailure(_)));

        let handle = MediaSourceHandle::new(vec![MediaKind::Video]);
        adapter.attach_local_media(handle).await.expect("attach");
        adapter.create_offer(OfferConstraints::default()).await.expect("offer");
        assert_eq!(engine.count(|c| matches!(c, EngineCall::CreateOffer)), 1);
    }

    #[tokio::test]
    async fn detach_removes_only_attached_media() {
        let (engine, adapter, _rx) = adapter(false);
        let handle = MediaSourceHandle::new(vec![MediaKind::Video, MediaKind::Audio]);

        let err = adapter.detach_local_media(&handle).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert_eq!(engine.count(|c| matches!(c, EngineCall::RemoveMedia(_))), 0);

        adapter.attach_local_media(handle.clone()).await.expect("attach");
        assert!(adapter.has_local_media());
        adapter.detach_local_media(&handle).await.expect("detach");
        assert!(!adapter.has_local_media());
        assert_eq!(engine.calls().last(), Some(&EngineCall::RemoveMedia(handle.id)));
    }

    #[tokio::test]
    async fn engine_rejection_is_negotiation_failure() {
        let (engine, adapter, _rx) = adapter(false);
        engine.fail_set_remote("malformed sdp");
        let err = adapter
            .set_remote_description(SessionDescription::offer("garbage"))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NegotiationFailure("malformed sdp".to_string()));
        assert!(!adapter.has_remote_description());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_suppresses_events() {
        let (engine, adapter, mut rx) = adapter(false);
        assert!(engine.emit(EngineEvent::ConnectionState(ConnectionState::Connecting)));
        assert!(rx.try_recv().is_ok());

        assert!(adapter.close().await);
        assert!(!adapter.close().await);
        assert_eq!(engine.count(|c| matches!(c, EngineCall::Close)), 1);

        assert!(!engine.emit(EngineEvent::LocalCandidate(IceCandidate::new("candidate:9"))));
        assert!(rx.try_recv().is_err());

        let err = adapter.create_offer(OfferConstraints::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }
}
