//! Event loop around [`SessionMachine`]

use super::{
    EndReason, PeerIdentity, SessionEvent, SessionMachine, SessionNotification, SessionPhase,
    SessionSettings, UserCommand,
};
use crate::error::SessionError;
use crate::transport::SignalingChannel;
use crate::webrtc::media::MediaSourceHandle;
use crate::webrtc::negotiation::NegotiationEngine;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create the single event queue a session consumes
pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Cloneable handle for issuing user commands to a running session
#[derive(Clone)]
pub struct SessionHandle {
    events: EventSender,
}

impl SessionHandle {
    pub fn request_session(&self, target: PeerIdentity) -> Result<(), SessionError> {
        self.send(UserCommand::RequestSession { target })
    }

    pub fn attach_media(&self, source: MediaSourceHandle) -> Result<(), SessionError> {
        self.send(UserCommand::AttachMedia(source))
    }

    pub fn detach_media(&self, source: MediaSourceHandle) -> Result<(), SessionError> {
        self.send(UserCommand::DetachMedia(source))
    }

    pub fn cancel(&self) -> Result<(), SessionError> {
        self.send(UserCommand::Cancel)
    }

    fn send(&self, command: UserCommand) -> Result<(), SessionError> {
        self.events
            .send(SessionEvent::Command(command))
            .map_err(|_| SessionError::InvalidState("session is no longer running".to_string()))
    }
}

/// Owns a [`SessionMachine`] and feeds it from the event queue
pub struct SessionDriver {
    machine: SessionMachine,
    events: EventReceiver,
}

impl SessionDriver {
    /// `queue` must be the pair the channel was opened with.
    pub fn new(
        settings: SessionSettings,
        local_peer: PeerIdentity,
        engine: Arc<dyn NegotiationEngine>,
        channel: SignalingChannel,
        queue: (EventSender, EventReceiver),
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionNotification>) {
        let (events_tx, events_rx) = queue;
        let (observer, notifications) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            events: events_tx.clone(),
        };
        let machine = SessionMachine::new(settings, local_peer, engine, channel, events_tx, observer);

        (
            Self {
                machine,
                events: events_rx,
            },
            handle,
            notifications,
        )
    }

    /// Process events until the session ends
    pub async fn run(mut self) -> EndReason {
        info!("Session driver started for peer {}", self.machine.descriptor().local_peer);

        while let Some(event) = self.events.recv().await {
            if let Err(e) = self.machine.handle(event) {
                debug!("Event rejected: {}", e);
            }
            if self.machine.phase() == SessionPhase::Ended {
                break;
            }
        }

        self.machine
            .end_reason()
            .cloned()
            .unwrap_or(EndReason::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use crate::transport::SignalingMessage;
    use crate::webrtc::negotiation::{ConnectionState, EngineEvent};
    use crate::webrtc::testing::{ScriptedEngine, OFFER_SDP};
    use std::time::Duration;

    async fn next_phase(
        notes: &mut mpsc::UnboundedReceiver<SessionNotification>,
        wanted: SessionPhase,
    ) {
        let wait = async {
            while let Some(note) = notes.recv().await {
                if note == (SessionNotification::PhaseChanged { phase: wanted }) {
                    return;
                }
            }
            panic!("notifications closed before {}", wanted);
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("phase change");
    }

    #[tokio::test]
    async fn drives_session_to_active_and_cancels() {
        let engine = ScriptedEngine::new();
        let queue = event_queue();
        let (channel, mut server) = SignalingChannel::loopback(queue.0.clone());
        let (driver, handle, mut notes) = SessionDriver::new(
            SessionSettings::default(),
            PeerIdentity::new("4821"),
            engine.clone(),
            channel,
            queue,
        );
        let task = tokio::spawn(driver.run());

        server.open();
        server.deliver(&SignalingMessage::ConnectOk {});
        next_phase(&mut notes, SessionPhase::Registered).await;

        handle
            .request_session(PeerIdentity::from_number(1234))
            .expect("request");
        server.deliver(&SignalingMessage::SessionOk {
            role: Some(Role::Initiator),
            peer_id: None,
        });
        next_phase(&mut notes, SessionPhase::Negotiating).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.deliver(&SignalingMessage::AnswerSdp { sdp: "v=0".to_string() });
        engine.emit(EngineEvent::ConnectionState(ConnectionState::Connected));
        next_phase(&mut notes, SessionPhase::Active).await;

        handle.cancel().expect("cancel");
        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("driver finished")
            .expect("join");
        assert_eq!(reason, EndReason::Cancelled);

        let sent = server.sent();
        assert_eq!(sent[0], SignalingMessage::connect("4821"));
        assert!(sent.contains(&SignalingMessage::OfferSdp { sdp: OFFER_SDP.to_string() }));
        assert_eq!(sent.last(), Some(&SignalingMessage::SessionEnd {}));
    }

    #[tokio::test]
    async fn commands_after_end_are_rejected() {
        let engine = ScriptedEngine::new();
        let queue = event_queue();
        let (channel, server) = SignalingChannel::loopback(queue.0.clone());
        let (driver, handle, _notes) = SessionDriver::new(
            SessionSettings::default(),
            PeerIdentity::new("4821"),
            engine,
            channel,
            queue,
        );
        let task = tokio::spawn(driver.run());

        server.hang_up();
        let reason = task.await.expect("join");
        assert_eq!(reason, EndReason::ChannelClosed);
        assert!(matches!(handle.cancel(), Err(SessionError::InvalidState(_))));
    }
}
