//! Session state machine
//!
//! Consumes one [`SessionEvent`] at a time and never blocks. Engine work is
//! spawned as operations whose completions come back through the same queue,
//! one operation in flight at a time. Every completion carries the epoch it
//! was dispatched under; teardown bumps the epoch so late completions have no
//! effect.

use super::{
    CandidateBuffer, EndReason, EventSender, PeerIdentity, Role, SessionDescriptor, SessionEvent,
    SessionNotification, SessionPhase, SessionSettings, UserCommand,
};
use crate::error::SessionError;
use crate::transport::{MessageCodec, SignalingChannel, SignalingMessage};
use crate::webrtc::media::{MediaKind, MediaSourceHandle};
use crate::webrtc::negotiation::{
    ConnectionState, EngineEvent, EngineEvents, IceCandidate, NegotiationAdapter,
    NegotiationEngine, OfferConstraints, SdpKind, SessionDescription,
};
use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One asynchronous negotiation step
#[derive(Debug)]
enum Operation {
    /// create_offer + set_local_description
    CreateOffer,
    ApplyRemote(SessionDescription),
    /// create_answer + set_local_description
    CreateAnswer,
    AddCandidates(Vec<IceCandidate>),
    AttachMedia(MediaSourceHandle),
    DetachMedia(MediaSourceHandle),
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::CreateOffer => "create-offer",
            Operation::ApplyRemote(_) => "apply-remote",
            Operation::CreateAnswer => "create-answer",
            Operation::AddCandidates(_) => "add-candidates",
            Operation::AttachMedia(_) => "attach-media",
            Operation::DetachMedia(_) => "detach-media",
        }
    }

    async fn run(self, adapter: &NegotiationAdapter, constraints: OfferConstraints) -> OperationOutcome {
        match self {
            Operation::CreateOffer => OperationOutcome::OfferReady(
                async {
                    let offer = adapter.create_offer(constraints).await?;
                    adapter.set_local_description(offer.clone()).await?;
                    Ok::<_, SessionError>(offer)
                }
                .await,
            ),
            Operation::ApplyRemote(desc) => {
                let kind = desc.kind;
                OperationOutcome::RemoteApplied(adapter.set_remote_description(desc).await.map(|_| kind))
            }
            Operation::CreateAnswer => OperationOutcome::AnswerReady(
                async {
                    let answer = adapter.create_answer(constraints).await?;
                    adapter.set_local_description(answer.clone()).await?;
                    Ok::<_, SessionError>(answer)
                }
                .await,
            ),
            Operation::AddCandidates(candidates) => {
                let count = candidates.len();
                OperationOutcome::CandidatesApplied(
                    async {
                        for candidate in candidates {
                            adapter.add_remote_candidate(candidate).await?;
                        }
                        Ok::<_, SessionError>(count)
                    }
                    .await,
                )
            }
            Operation::AttachMedia(source) => {
                OperationOutcome::MediaAttached(adapter.attach_local_media(source).await)
            }
            Operation::DetachMedia(source) => {
                OperationOutcome::MediaDetached(adapter.detach_local_media(&source).await)
            }
        }
    }
}

/// Result of a negotiation operation
#[derive(Debug)]
pub enum OperationOutcome {
    OfferReady(Result<SessionDescription, SessionError>),
    RemoteApplied(Result<SdpKind, SessionError>),
    AnswerReady(Result<SessionDescription, SessionError>),
    CandidatesApplied(Result<usize, SessionError>),
    MediaAttached(Result<(), SessionError>),
    MediaDetached(Result<(), SessionError>),
}

/// The signaling session state machine
pub struct SessionMachine {
    descriptor: SessionDescriptor,
    settings: SessionSettings,
    adapter: Arc<NegotiationAdapter>,
    channel: SignalingChannel,
    events: EventSender,
    observer: mpsc::UnboundedSender<SessionNotification>,
    candidates: CandidateBuffer,
    /// Target of our own SESSION request
    requested_target: Option<PeerIdentity>,
    /// We received a SESSION naming us as target
    invited: bool,
    /// Our offer or answer went out
    local_description_sent: bool,
    /// A remote offer/answer was accepted for this round
    remote_description_seen: bool,
    /// ...and the engine has it
    remote_description_applied: bool,
    remote_tracks: HashSet<MediaKind>,
    operations: VecDeque<Operation>,
    in_flight: bool,
    epoch: u64,
    timer_generation: u64,
    idle_timer: Option<JoinHandle<()>>,
    end_reason: Option<EndReason>,
}

impl SessionMachine {
    pub fn new(
        settings: SessionSettings,
        local_peer: PeerIdentity,
        engine: Arc<dyn NegotiationEngine>,
        channel: SignalingChannel,
        events: EventSender,
        observer: mpsc::UnboundedSender<SessionNotification>,
    ) -> Self {
        let adapter = Arc::new(NegotiationAdapter::new(
            engine,
            EngineEvents::new(events.clone()),
            settings.require_local_media,
        ));

        Self {
            descriptor: SessionDescriptor::new(local_peer),
            settings,
            adapter,
            channel,
            events,
            observer,
            candidates: CandidateBuffer::new(),
            requested_target: None,
            invited: false,
            local_description_sent: false,
            remote_description_seen: false,
            remote_description_applied: false,
            remote_tracks: HashSet::new(),
            operations: VecDeque::new(),
            in_flight: false,
            epoch: 0,
            timer_generation: 0,
            idle_timer: None,
            end_reason: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.descriptor.phase
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    /// Remote candidates waiting for a remote description
    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// An operation is running or queued
    pub fn is_busy(&self) -> bool {
        self.in_flight || !self.operations.is_empty()
    }

    /// Process one event.
    ///
    /// Rejected events return the error after it has been logged; recoverable
    /// errors leave the state untouched, fatal ones have already ended the
    /// session.
    pub fn handle(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        if self.descriptor.phase == SessionPhase::Ended {
            debug!("Session ended, ignoring {}", event_label(&event));
            return Ok(());
        }

        let result = match event {
            SessionEvent::ChannelOpened => self.on_channel_opened(),
            SessionEvent::ChannelMessage(text) => {
                MessageCodec::decode(&text).and_then(|message| self.on_message(message))
            }
            SessionEvent::ChannelClosed => Err(SessionError::ChannelClosed),
            SessionEvent::Engine(event) => self.on_engine_event(event),
            SessionEvent::Command(command) => self.on_command(command),
            SessionEvent::OperationComplete { epoch, outcome } => {
                self.on_operation_complete(epoch, outcome)
            }
            SessionEvent::IdleTimeout { generation } => {
                self.on_idle_timeout(generation);
                Ok(())
            }
        };

        if let Err(ref err) = result {
            self.on_error(err);
        }
        if self.descriptor.phase != SessionPhase::Ended {
            self.dispatch_next();
        }
        result
    }

    fn on_error(&mut self, err: &SessionError) {
        match err {
            SessionError::MalformedMessage(_) | SessionError::InvalidState(_) => {
                warn!("Dropping signaling event: {}", err);
            }
            SessionError::DeviceUnavailable(_) => {
                warn!("{}", err);
            }
            SessionError::NegotiationFailure(reason) => {
                warn!("{}", err);
                if self.descriptor.phase.is_paired() {
                    let _ = self.channel.send(&SignalingMessage::session_error(reason.clone()));
                }
                self.end(EndReason::NegotiationFailed(reason.clone()));
            }
            SessionError::ChannelClosed => {
                self.end(EndReason::ChannelClosed);
            }
        }
    }

    fn on_channel_opened(&mut self) -> Result<(), SessionError> {
        self.expect_phase(&[SessionPhase::Idle], "channel open")?;
        let connect = SignalingMessage::connect(self.descriptor.local_peer.as_str());
        self.channel.send(&connect)?;
        self.set_phase(SessionPhase::Connecting);
        Ok(())
    }

    fn on_message(&mut self, message: SignalingMessage) -> Result<(), SessionError> {
        debug!("<- {}", message.name());
        match message {
            SignalingMessage::ConnectOk {} => {
                self.expect_phase(&[SessionPhase::Connecting], "CONNECT_OK")?;
                info!("Registered as peer {}", self.descriptor.local_peer);
                self.set_phase(SessionPhase::Registered);
                Ok(())
            }
            SignalingMessage::Session { target_id } => self.on_session_invite(target_id),
            SignalingMessage::SessionOk { role, peer_id } => self.on_session_ok(role, peer_id),
            SignalingMessage::OfferSdp { sdp } => {
                self.on_remote_description(SessionDescription::offer(sdp))
            }
            SignalingMessage::AnswerSdp { sdp } => {
                self.on_remote_description(SessionDescription::answer(sdp))
            }
            SignalingMessage::OnIceCandidate { candidate } => self.on_remote_candidate(candidate),
            SignalingMessage::SessionEnd {} => {
                self.end(EndReason::Remote);
                Ok(())
            }
            SignalingMessage::SessionError { reason } => {
                warn!("Remote session error: {}", reason.as_deref().unwrap_or("unspecified"));
                self.end(EndReason::RemoteError(reason));
                Ok(())
            }
            SignalingMessage::Connect { .. } => Err(SessionError::InvalidState(
                "CONNECT is never sent by the server".to_string(),
            )),
        }
    }

    fn on_session_invite(&mut self, target_id: u64) -> Result<(), SessionError> {
        self.expect_phase(&[SessionPhase::Registered, SessionPhase::AwaitingPeer], "SESSION")?;
        if self.descriptor.local_peer.as_number() != Some(target_id) {
            return Err(SessionError::InvalidState(format!(
                "SESSION addressed to {}, we are {}",
                target_id, self.descriptor.local_peer
            )));
        }
        if self.invited {
            debug!("Duplicate SESSION invite ignored");
            return Ok(());
        }
        if self.requested_target.is_some() {
            info!("Invited while our own request is pending");
        }

        self.invited = true;
        if self.descriptor.phase == SessionPhase::Registered {
            self.set_phase(SessionPhase::AwaitingPeer);
            self.arm_idle_timer();
        }
        Ok(())
    }

    fn on_session_ok(&mut self, role: Option<Role>, peer_id: Option<String>) -> Result<(), SessionError> {
        self.expect_phase(&[SessionPhase::AwaitingPeer], "SESSION_OK")?;

        self.descriptor.remote_peer = peer_id
            .map(PeerIdentity::new)
            .or_else(|| self.requested_target.clone());
        let role = match role {
            Some(role) => role,
            None if self.invited && self.requested_target.is_some() => self.glare_role(),
            None if self.invited => self.settings.requester_role.opposite(),
            None => self.settings.requester_role,
        };
        self.descriptor.role = Some(role);

        info!(
            "Paired with {} as {:?}",
            self.descriptor
                .remote_peer
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown peer".to_string()),
            role
        );
        self.set_phase(SessionPhase::Negotiating);
        self.arm_idle_timer();

        if role == Role::Initiator {
            self.operations.push_back(Operation::CreateOffer);
        }
        Ok(())
    }

    /// Both sides requested each other and the server named no role: the
    /// numerically lower peer id offers.
    fn glare_role(&self) -> Role {
        let local = &self.descriptor.local_peer;
        let Some(remote) = self.descriptor.remote_peer.as_ref() else {
            return self.settings.requester_role;
        };
        let local_first = match (local.as_number(), remote.as_number()) {
            (Some(a), Some(b)) => a < b,
            _ => local.as_str() < remote.as_str(),
        };
        let role = if local_first { Role::Initiator } else { Role::Responder };
        info!("Glare with {}, taking {:?}", remote, role);
        role
    }

    fn on_remote_description(&mut self, desc: SessionDescription) -> Result<(), SessionError> {
        let (label, expected_role) = match desc.kind {
            SdpKind::Offer => ("OFFER_SDP", Role::Responder),
            SdpKind::Answer => ("ANSWER_SDP", Role::Initiator),
        };
        self.expect_phase(&[SessionPhase::Negotiating, SessionPhase::Active], label)?;

        if self.descriptor.role != Some(expected_role) {
            return Err(SessionError::InvalidState(format!(
                "{} received while {:?}",
                label, self.descriptor.role
            )));
        }
        if self.remote_description_seen {
            debug!("Duplicate {} ignored", label);
            return Ok(());
        }
        if desc.kind == SdpKind::Answer && !self.local_description_sent {
            return Err(SessionError::InvalidState(
                "ANSWER_SDP before our offer was sent".to_string(),
            ));
        }

        self.remote_description_seen = true;
        self.operations.push_back(Operation::ApplyRemote(desc));
        Ok(())
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.expect_phase(
            &[SessionPhase::AwaitingPeer, SessionPhase::Negotiating, SessionPhase::Active],
            "ON_ICE_CANDIDATE",
        )?;

        if self.remote_description_applied {
            self.operations.push_back(Operation::AddCandidates(vec![candidate]));
        } else {
            self.candidates.push(candidate);
            debug!("Buffered remote candidate ({} pending)", self.candidates.len());
        }
        Ok(())
    }

    fn on_engine_event(&mut self, event: EngineEvent) -> Result<(), SessionError> {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if self.descriptor.phase.is_paired() {
                    self.channel.send(&SignalingMessage::OnIceCandidate { candidate })?;
                } else {
                    debug!("Dropping local candidate discovered before pairing");
                }
                Ok(())
            }
            EngineEvent::RemoteTrack(kind) => {
                if self.remote_tracks.insert(kind) {
                    info!("Remote {} stream available", kind);
                    self.notify(SessionNotification::RemoteStream { kind });
                }
                Ok(())
            }
            EngineEvent::ConnectionState(state) => match state {
                ConnectionState::Connected => {
                    if self.descriptor.phase == SessionPhase::Negotiating {
                        info!("Media connected");
                        self.disarm_idle_timer();
                        self.set_phase(SessionPhase::Active);
                    }
                    Ok(())
                }
                ConnectionState::Failed => Err(SessionError::NegotiationFailure(
                    "media connection failed".to_string(),
                )),
                ConnectionState::Closed if self.descriptor.phase.is_paired() => Err(
                    SessionError::NegotiationFailure("media connection closed".to_string()),
                ),
                ConnectionState::Disconnected => {
                    warn!("Media connection interrupted");
                    Ok(())
                }
                other => {
                    debug!("Media connection state: {:?}", other);
                    Ok(())
                }
            },
        }
    }

    fn on_command(&mut self, command: UserCommand) -> Result<(), SessionError> {
        match command {
            UserCommand::RequestSession { target } => {
                if self.descriptor.phase == SessionPhase::AwaitingPeer {
                    return Err(SessionError::InvalidState(
                        "a session request is already pending".to_string(),
                    ));
                }
                self.expect_phase(&[SessionPhase::Registered], "session request")?;

                let target_id = target.as_number().ok_or_else(|| {
                    SessionError::InvalidState(format!("target {} is not a numeric peer id", target))
                })?;
                if target == self.descriptor.local_peer {
                    return Err(SessionError::InvalidState(
                        "cannot request a session with ourselves".to_string(),
                    ));
                }

                self.channel.send(&SignalingMessage::Session { target_id })?;
                info!("Requested session with peer {}", target);
                self.requested_target = Some(target);
                self.set_phase(SessionPhase::AwaitingPeer);
                self.arm_idle_timer();
                Ok(())
            }
            UserCommand::AttachMedia(source) => {
                self.operations.push_back(Operation::AttachMedia(source));
                Ok(())
            }
            UserCommand::DetachMedia(source) => {
                self.operations.push_back(Operation::DetachMedia(source));
                Ok(())
            }
            UserCommand::Cancel => {
                if self.descriptor.phase.is_paired() {
                    let _ = self.channel.send(&SignalingMessage::SessionEnd {});
                }
                self.end(EndReason::Cancelled);
                Ok(())
            }
        }
    }

    fn on_operation_complete(&mut self, epoch: u64, outcome: OperationOutcome) -> Result<(), SessionError> {
        if epoch != self.epoch {
            debug!("Discarding stale completion from epoch {}", epoch);
            return Ok(());
        }
        self.in_flight = false;

        match outcome {
            OperationOutcome::OfferReady(result) => {
                let offer = result?;
                self.channel.send(&SignalingMessage::OfferSdp { sdp: offer.sdp })?;
                self.local_description_sent = true;
                info!("Offer sent");
            }
            OperationOutcome::RemoteApplied(result) => {
                let kind = result?;
                self.remote_description_applied = true;
                debug!("Remote {} applied", kind);

                let pending = self.candidates.drain();
                if !pending.is_empty() {
                    debug!("Flushing {} buffered remote candidates", pending.len());
                    self.operations.push_back(Operation::AddCandidates(pending));
                }
                if kind == SdpKind::Offer {
                    self.operations.push_back(Operation::CreateAnswer);
                }
            }
            OperationOutcome::AnswerReady(result) => {
                let answer = result?;
                self.channel.send(&SignalingMessage::AnswerSdp { sdp: answer.sdp })?;
                self.local_description_sent = true;
                info!("Answer sent");
            }
            OperationOutcome::CandidatesApplied(result) => {
                let count = result?;
                debug!("Applied {} remote candidates", count);
            }
            OperationOutcome::MediaAttached(result) => match result {
                Ok(()) => {
                    if self.local_description_sent {
                        info!("Local media attached after negotiation; renegotiation needed");
                        self.notify(SessionNotification::RenegotiationNeeded);
                    }
                }
                Err(e) => {
                    warn!("Failed to attach local media: {}", e);
                    self.notify(SessionNotification::LocalMediaRejected {
                        reason: e.to_string(),
                    });
                }
            },
            OperationOutcome::MediaDetached(result) => match result {
                Ok(()) => {
                    if self.local_description_sent {
                        info!("Local media detached after negotiation; renegotiation needed");
                        self.notify(SessionNotification::RenegotiationNeeded);
                    }
                }
                Err(SessionError::InvalidState(reason)) => {
                    warn!("Cannot detach local media: {}", reason);
                }
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }

    fn on_idle_timeout(&mut self, generation: u64) {
        if generation != self.timer_generation {
            return;
        }
        if matches!(
            self.descriptor.phase,
            SessionPhase::AwaitingPeer | SessionPhase::Negotiating
        ) {
            warn!("Session made no progress in {}", self.descriptor.phase);
            if self.descriptor.phase.is_paired() {
                let _ = self.channel.send(&SignalingMessage::SessionEnd {});
            }
            self.end(EndReason::IdleTimeout);
        }
    }

    /// Start the next queued operation unless one is already running
    fn dispatch_next(&mut self) {
        if self.in_flight {
            return;
        }
        let Some(operation) = self.operations.pop_front() else {
            return;
        };

        debug!("Dispatching {} (epoch {})", operation.name(), self.epoch);
        self.in_flight = true;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let epoch = self.epoch;
        let constraints = self.settings.offer_constraints;
        tokio::spawn(async move {
            let outcome = operation.run(&adapter, constraints).await;
            let _ = events.send(SessionEvent::OperationComplete { epoch, outcome });
        });
    }

    fn arm_idle_timer(&mut self) {
        self.disarm_idle_timer();
        let Some(timeout) = self.settings.idle_timeout else {
            return;
        };
        let generation = self.timer_generation;
        let events = self.events.clone();
        self.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(SessionEvent::IdleTimeout { generation });
        }));
    }

    fn disarm_idle_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    fn expect_phase(&self, allowed: &[SessionPhase], what: &str) -> Result<(), SessionError> {
        if allowed.contains(&self.descriptor.phase) {
            Ok(())
        } else {
            Err(SessionError::InvalidState(format!(
                "{} in phase {}",
                what, self.descriptor.phase
            )))
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        debug!("Session phase: {} -> {}", self.descriptor.phase, phase);
        self.descriptor.phase = phase;
        self.notify(SessionNotification::PhaseChanged { phase });
    }

    fn notify(&self, notification: SessionNotification) {
        let _ = self.observer.send(notification);
    }

    /// Enter `Ended`. Releases the engine, clears buffers and notifies the
    /// observer; later calls do nothing.
    fn end(&mut self, reason: EndReason) {
        if self.descriptor.phase == SessionPhase::Ended {
            return;
        }
        info!("Session {} ended: {}", self.descriptor.local_peer, reason);

        self.descriptor.phase = SessionPhase::Ended;
        self.epoch += 1;
        self.disarm_idle_timer();
        self.operations.clear();
        self.in_flight = false;
        self.candidates.clear();
        self.adapter.shutdown();
        self.channel.close();

        self.end_reason = Some(reason.clone());
        self.notify(SessionNotification::Ended { reason });
    }
}

impl Drop for SessionMachine {
    fn drop(&mut self) {
        if self.descriptor.phase != SessionPhase::Ended {
            self.disarm_idle_timer();
            self.adapter.shutdown();
            self.channel.close();
        }
    }
}

fn event_label(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::ChannelOpened => "channel-opened",
        SessionEvent::ChannelMessage(_) => "channel-message",
        SessionEvent::ChannelClosed => "channel-closed",
        SessionEvent::Engine(_) => "engine-event",
        SessionEvent::Command(_) => "command",
        SessionEvent::OperationComplete { .. } => "operation-complete",
        SessionEvent::IdleTimeout { .. } => "idle-timeout",
    }
}
