//! rtsp-peer - Main entry point
//!
//! Registers with the signaling server, optionally asks the bridge API for an
//! RTSP bridge to pair with, and runs one session until it ends.

mod args;

use args::Args;
use clap::Parser;
use log::{error, info, warn};
use rtsp_peer::config::Config;
use rtsp_peer::session::{
    event_queue, PeerIdentity, SessionDriver, SessionNotification, SessionPhase, SessionSettings,
};
use rtsp_peer::transport::{BootstrapClient, SignalingChannel};
use rtsp_peer::webrtc::media::{LocalMediaManager, MediaConstraints, SyntheticDevice};
use rtsp_peer::webrtc::RtcEngine;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    let (mut config, load_error) = match args.load_config() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RTSP_PEER_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("rtsp-peer v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        Some(e) => warn!("Failed to load config: {}, using defaults", e),
        None => info!("Loaded configuration from {:?}", args.config),
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    // Resolve the session target before registering
    let target = match (args.target, args.rtsp_url.as_deref()) {
        (Some(id), _) => Some(PeerIdentity::from_number(id)),
        (None, Some(rtsp_url)) => {
            info!("Requesting RTSP bridge for {}", rtsp_url);
            let client = BootstrapClient::new(&config.bootstrap)?;
            match client.create_session(rtsp_url, args.method).await {
                Ok(peer) => Some(peer),
                Err(e) => {
                    error!("Failed to bootstrap session: {}", e);
                    return Err(e.into());
                }
            }
        }
        (None, None) => None,
    };

    let local_peer = match args.peer_id {
        Some(ref id) => PeerIdentity::new(id.clone()),
        None => PeerIdentity::generate(),
    };
    info!("Local peer id: {}", local_peer);

    let engine = Arc::new(RtcEngine::new(&config.ice_servers).await?);

    let queue = event_queue();
    let channel = SignalingChannel::connect(&config.signaling.url, queue.0.clone()).await?;
    let (driver, handle, mut notifications) = SessionDriver::new(
        SessionSettings::from(&config.session),
        local_peer,
        engine,
        channel,
        queue,
    );

    let mut media = LocalMediaManager::new(Box::new(SyntheticDevice));
    if args.with_media {
        match media.acquire(&MediaConstraints::from(&config.media)) {
            Ok(source) => handle.attach_media(source)?,
            Err(e) => warn!("Continuing without local media: {}", e),
        }
    }

    let session = tokio::spawn(driver.run());

    loop {
        tokio::select! {
            note = notifications.recv() => match note {
                Some(SessionNotification::PhaseChanged { phase }) => {
                    info!("Session phase: {}", phase);
                    if phase == SessionPhase::Registered {
                        match target {
                            Some(ref target) => {
                                if let Err(e) = handle.request_session(target.clone()) {
                                    warn!("Failed to request session: {}", e);
                                }
                            }
                            None => info!("Waiting for a session invitation"),
                        }
                    }
                }
                Some(SessionNotification::RemoteStream { kind }) => {
                    info!("Receiving remote {} stream", kind);
                }
                Some(SessionNotification::RenegotiationNeeded) => {
                    warn!("Local media changed after negotiation; the remote side will not see it");
                }
                Some(SessionNotification::LocalMediaRejected { reason }) => {
                    warn!("Local media rejected: {}", reason);
                }
                Some(SessionNotification::Ended { .. }) | None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, cancelling session");
                let _ = handle.cancel();
            }
        }
    }

    let reason = session.await?;
    media.release_all();
    info!("Session finished: {}", reason);
    Ok(())
}
