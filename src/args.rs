use clap::Parser;
use rtsp_peer::config::{Config, ConfigError};
use rtsp_peer::transport::TransformMethod;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rtsp-peer")]
#[command(version)]
#[command(about = "WebRTC signaling peer for RTSP bridges", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "rtsp-peer.toml")]
    pub config: PathBuf,

    /// Signaling server URL (overrides config)
    #[arg(long)]
    pub signaling_url: Option<String>,

    /// Numeric peer id to register with (random 4-digit code if omitted)
    #[arg(long, value_parser = parse_peer_id)]
    pub peer_id: Option<String>,

    /// Peer id of the remote endpoint to request a session with
    #[arg(short, long, conflicts_with = "rtsp_url")]
    pub target: Option<u64>,

    /// RTSP stream to bridge; the bridge's peer id becomes the target
    #[arg(long)]
    pub rtsp_url: Option<String>,

    /// Bridge direction used with --rtsp-url
    #[arg(long, value_enum, default_value = "pull")]
    pub method: TransformMethod,

    /// Attach a local media source before requesting the session
    #[arg(long, action)]
    pub with_media: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        Config::load(&self.config)
    }

    /// Apply command line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref url) = self.signaling_url {
            config.signaling.url = url.clone();
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

/// Peer ids double as numeric `targetId`s, so only decimal codes are usable
fn parse_peer_id(value: &str) -> Result<String, String> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("peer id must be decimal digits, got {:?}", value));
    }
    value
        .parse::<u64>()
        .map(|_| value.to_string())
        .map_err(|e| format!("peer id out of range: {}", e))
}
