//! webrtc-rs backed negotiation engine
//!
//! Wraps one RTCPeerConnection and maps its callbacks onto engine events.

use super::media::{MediaKind, MediaSourceHandle};
use super::negotiation::{
    ConnectionState, EngineEvent, EngineEvents, IceCandidate, NegotiationEngine, OfferConstraints,
    SdpKind, SessionDescription,
};
use crate::config::IceServerConfig;
use crate::error::EngineError;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

/// Negotiation engine over a webrtc-rs peer connection
pub struct RtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    /// Senders created for each attached media source
    senders: Mutex<HashMap<Uuid, Vec<Arc<RTCRtpSender>>>>,
}

impl RtcEngine {
    /// Create a peer connection using the given ICE servers
    pub async fn new(ice_servers: &[IceServerConfig]) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::new(format!("Failed to register codecs: {}", e)))?;

        // Interceptors for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::new(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| EngineError::new(format!("Failed to create peer connection: {}", e)))?;

        info!("Peer connection created ({} ICE servers)", ice_servers.len());
        Ok(Self {
            peer_connection: Arc::new(peer_connection),
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// Make sure the offer carries a receive m-line for every wanted kind
    async fn ensure_receivers(&self, constraints: OfferConstraints) -> Result<(), EngineError> {
        let transceivers = self.peer_connection.get_transceivers().await;
        let wanted = [
            (constraints.receive_video, RTPCodecType::Video),
            (constraints.receive_audio, RTPCodecType::Audio),
        ];

        for (enabled, kind) in wanted {
            if !enabled || transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: Vec::new(),
            };
            self.peer_connection
                .add_transceiver_from_kind(kind, Some(init))
                .await
                .map_err(|e| EngineError::new(format!("Failed to add {:?} receiver: {}", kind, e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    fn subscribe(&self, events: EngineEvents) {
        let candidate_events = events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = candidate_events.clone();
                Box::pin(async move {
                    // None marks the end of gathering
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            events.emit(EngineEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                                ..IceCandidate::new("")
                            }));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let track_events = events.clone();
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(MediaKind::Audio),
                    RTPCodecType::Video => Some(MediaKind::Video),
                    _ => None,
                };
                Box::pin(async move {
                    if let Some(kind) = kind {
                        events.emit(EngineEvent::RemoteTrack(kind));
                    }
                })
            },
        ));

        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    debug!("Peer connection state: {:?}", state);
                    events.emit(EngineEvent::ConnectionState(state.into()));
                })
            }));
    }

    async fn create_offer(&self, constraints: OfferConstraints) -> Result<SessionDescription, EngineError> {
        self.ensure_receivers(constraints).await?;
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| EngineError::new(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self, _constraints: OfferConstraints) -> Result<SessionDescription, EngineError> {
        // Receivers for every offered m-line are created by set_remote_description
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| EngineError::new(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|e| EngineError::new(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| EngineError::new(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::new(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_local_media(&self, source: &MediaSourceHandle) -> Result<(), EngineError> {
        let mut added = Vec::with_capacity(source.kinds.len());
        for kind in &source.kinds {
            let capability = match kind {
                MediaKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                MediaKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
            };
            let track = Arc::new(TrackLocalStaticSample::new(
                capability,
                format!("{}-{}", kind, source.id),
                format!("rtsp-peer-{}", source.id),
            ));
            let sender = self
                .peer_connection
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| EngineError::new(format!("Failed to add {} track: {}", kind, e)))?;
            debug!("Attached local {} track from source {}", kind, source.id);
            added.push(sender);
        }
        self.senders.lock().entry(source.id).or_default().extend(added);
        Ok(())
    }

    async fn remove_local_media(&self, source: &MediaSourceHandle) -> Result<(), EngineError> {
        let senders = self.senders.lock().remove(&source.id).unwrap_or_default();
        for sender in senders {
            self.peer_connection
                .remove_track(&sender)
                .await
                .map_err(|e| EngineError::new(format!("Failed to remove track: {}", e)))?;
        }
        debug!("Detached local media source {}", source.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| EngineError::new(format!("Failed to close connection: {}", e)))
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| EngineError::new(format!("Invalid SDP {}: {}", desc.kind, e)))
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}
