//! Scripted negotiation engine for unit tests

use super::media::MediaSourceHandle;
use super::negotiation::{
    EngineEvent, EngineEvents, IceCandidate, NegotiationEngine, OfferConstraints, SdpKind,
    SessionDescription,
};
use crate::error::EngineError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

pub const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=offer\r\n";
pub const ANSWER_SDP: &str = "v=0\r\no=- 2 1 IN IP4 127.0.0.1\r\ns=answer\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind, String),
    AddCandidate(String),
    AddMedia(Uuid),
    RemoveMedia(Uuid),
    Close,
}

/// Records every call and succeeds unless told otherwise
#[derive(Default)]
pub struct ScriptedEngine {
    calls: Mutex<Vec<EngineCall>>,
    events: Mutex<Option<EngineEvents>>,
    set_remote_error: Mutex<Option<String>>,
    create_offer_error: Mutex<Option<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    /// Fire an engine callback as the real engine would
    pub fn emit(&self, event: EngineEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => events.emit(event),
            None => false,
        }
    }

    pub fn fail_set_remote(&self, reason: &str) {
        *self.set_remote_error.lock() = Some(reason.to_string());
    }

    pub fn fail_create_offer(&self, reason: &str) {
        *self.create_offer_error.lock() = Some(reason.to_string());
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl NegotiationEngine for ScriptedEngine {
    fn subscribe(&self, events: EngineEvents) {
        *self.events.lock() = Some(events);
    }

    async fn create_offer(&self, _constraints: OfferConstraints) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateOffer);
        if let Some(reason) = self.create_offer_error.lock().clone() {
            return Err(EngineError::new(reason));
        }
        Ok(SessionDescription::offer(OFFER_SDP))
    }

    async fn create_answer(&self, _constraints: OfferConstraints) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateAnswer);
        Ok(SessionDescription::answer(ANSWER_SDP))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(EngineCall::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(EngineCall::SetRemote(desc.kind, desc.sdp));
        if let Some(reason) = self.set_remote_error.lock().clone() {
            return Err(EngineError::new(reason));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(EngineCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_local_media(&self, source: &MediaSourceHandle) -> Result<(), EngineError> {
        self.record(EngineCall::AddMedia(source.id));
        Ok(())
    }

    async fn remove_local_media(&self, source: &MediaSourceHandle) -> Result<(), EngineError> {
        self.record(EngineCall::RemoveMedia(source.id));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Close);
        Ok(())
    }
}
