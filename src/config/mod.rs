//! Configuration management for rtsp-peer

use crate::session::Role;
use crate::webrtc::media::FacingMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signaling server connection
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Session bootstrap API
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// STUN/TURN servers handed to the media engine
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Session policy
    #[serde(default)]
    pub session: SessionConfig,

    /// Local capture constraints
    #[serde(default)]
    pub media: MediaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling server
    pub url: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "wss://signalling.xav1er.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Base URL of the bridge API
    pub api_base: String,

    /// Request timeout in seconds
    #[serde(default = "default_bootstrap_timeout")]
    pub timeout_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.xav1er.com".to_string(),
            timeout_secs: default_bootstrap_timeout(),
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds allowed in awaiting-peer or negotiating before giving up (0 disables)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Refuse to offer without local media attached
    #[serde(default)]
    pub require_local_media: bool,

    /// Role of the requesting side when the server assigns none
    #[serde(default = "default_requester_role")]
    pub requester_role: Role,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            require_local_media: false,
            requester_role: default_requester_role(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Capture video
    pub video: bool,

    /// Capture audio
    pub audio: bool,

    /// Capture width in pixels
    pub width: u32,

    /// Capture height in pixels
    pub height: u32,

    /// Camera facing preference
    #[serde(default)]
    pub facing_mode: FacingMode,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
            width: 480,
            height: 320,
            facing_mode: FacingMode::Environment,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            bootstrap: BootstrapConfig::default(),
            ice_servers: default_ice_servers(),
            session: SessionConfig::default(),
            media: MediaConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.signaling.url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(
                "signaling.url must be a ws:// or wss:// URL".to_string(),
            ));
        }

        if !(self.bootstrap.api_base.starts_with("http://") || self.bootstrap.api_base.starts_with("https://")) {
            return Err(ConfigError::Invalid(
                "bootstrap.api_base must be an http(s) URL".to_string(),
            ));
        }

        if self.bootstrap.timeout_secs == 0 {
            return Err(ConfigError::Invalid("bootstrap.timeout_secs must be non-zero".to_string()));
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::Invalid("ICE server without urls".to_string()));
            }
            for url in &server.urls {
                let scheme_ok = ["stun:", "stuns:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme));
                if !scheme_ok {
                    return Err(ConfigError::Invalid(format!("Unsupported ICE server url: {}", url)));
                }
                if url.starts_with("turn") && (server.username.is_none() || server.credential.is_none()) {
                    return Err(ConfigError::Invalid(format!("TURN server {} needs credentials", url)));
                }
            }
        }

        if self.media.width == 0 || self.media.height == 0 {
            return Err(ConfigError::Invalid("Media dimensions must be non-zero".to_string()));
        }

        if self.session.require_local_media && !self.media.video && !self.media.audio {
            return Err(ConfigError::Invalid(
                "require_local_media is set but media captures neither audio nor video".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig {
            urls: vec!["stun:106.54.7.149:3478".to_string()],
            username: None,
            credential: None,
        },
        IceServerConfig {
            urls: vec!["turn:106.54.7.149:3478".to_string()],
            username: Some("xav1er".to_string()),
            credential: Some("123456".to_string()),
        },
    ]
}

fn default_bootstrap_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_requester_role() -> Role {
    Role::Initiator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ice_servers.len(), 2);
        assert_eq!(cfg.session.idle_timeout_secs, 30);
    }

    #[test]
    fn validate_rejects_http_signaling_url() {
        let mut cfg = Config::default();
        cfg.signaling.url = "https://signalling.example".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_turn_credentials() {
        let mut cfg = Config::default();
        cfg.ice_servers[1].credential = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [signaling]
            url = "ws://127.0.0.1:9000"

            [session]
            idle_timeout_secs = 5
            requester_role = "responder"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.signaling.url, "ws://127.0.0.1:9000");
        assert_eq!(cfg.session.idle_timeout_secs, 5);
        assert_eq!(cfg.session.requester_role, Role::Responder);
        assert_eq!(cfg.media.width, 480);
        assert_eq!(cfg.ice_servers, default_ice_servers());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_field_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [media]
            audio = true

            [bootstrap]
            timeout_secs = 10

            [logging]
            "#,
        )
        .expect("parse");
        assert!(cfg.media.audio);
        assert!(cfg.media.video);
        assert_eq!((cfg.media.width, cfg.media.height), (480, 320));
        assert_eq!(cfg.bootstrap.api_base, "https://api.xav1er.com");
        assert_eq!(cfg.bootstrap.timeout_secs, 10);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/rtsp-peer.toml")).expect("load");
        assert_eq!(cfg.logging.level, "info");
    }
}
