//! Session bootstrap client
//!
//! Asks the bridge API to start an RTSP bridge and returns the peer id the
//! bridge registered under, which then becomes the session target.

use crate::config::BootstrapConfig;
use crate::session::PeerIdentity;
use log::{debug, info};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Response code the API uses for success
pub const SUCCESS_CODE: i64 = 2000;

/// Direction of the RTSP bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransformMethod {
    /// Pull an RTSP stream and deliver it over WebRTC
    #[value(name = "pull")]
    RtspToWebRtc,
    /// Push local WebRTC media out to an RTSP server
    #[value(name = "push")]
    WebRtcToRtsp,
}

impl TransformMethod {
    pub fn code(&self) -> u8 {
        match self {
            TransformMethod::RtspToWebRtc => 0,
            TransformMethod::WebRtcToRtsp => 1,
        }
    }
}

impl Serialize for TransformMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Invalid RTSP address: {0}")]
    InvalidUrl(String),
    #[error("Bootstrap request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Bootstrap rejected (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("Bootstrap response carried no peer id")]
    MissingPeer,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    method: TransformMethod,
    rtsp_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    msg: Option<String>,
}

/// HTTP client for `POST /createSession`
pub struct BootstrapClient {
    client: reqwest::Client,
    api_base: String,
}

impl BootstrapClient {
    pub fn new(config: &BootstrapConfig) -> Result<Self, BootstrapError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Start a bridge for `rtsp_url` and return its peer identity
    pub async fn create_session(
        &self,
        rtsp_url: &str,
        method: TransformMethod,
    ) -> Result<PeerIdentity, BootstrapError> {
        validate_rtsp_url(rtsp_url)?;

        let url = format!("{}/createSession", self.api_base);
        debug!("POST {} ({:?})", url, method);
        let envelope: Envelope = self
            .client
            .post(&url)
            .json(&CreateSessionRequest { method, rtsp_url })
            .send()
            .await?
            .json()
            .await?;

        let peer = parse_envelope(envelope)?;
        info!("Bridge registered as peer {}", peer);
        Ok(peer)
    }
}

pub fn validate_rtsp_url(url: &str) -> Result<(), BootstrapError> {
    match url.strip_prefix("rtsp://") {
        Some(rest) if !rest.is_empty() => Ok(()),
        _ => Err(BootstrapError::InvalidUrl(url.to_string())),
    }
}

fn parse_envelope(envelope: Envelope) -> Result<PeerIdentity, BootstrapError> {
    if envelope.code != SUCCESS_CODE {
        return Err(BootstrapError::Rejected {
            code: envelope.code,
            message: envelope.msg.unwrap_or_else(|| "request failed".to_string()),
        });
    }

    match envelope.data {
        Value::Number(n) => n.as_u64().map(PeerIdentity::from_number).ok_or(BootstrapError::MissingPeer),
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            Ok(PeerIdentity::new(s))
        }
        _ => Err(BootstrapError::MissingPeer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        serde_json::from_value(value).expect("envelope")
    }

    #[test]
    fn rtsp_url_validation() {
        assert!(validate_rtsp_url("rtsp://camera.local:554/stream").is_ok());
        assert!(matches!(
            validate_rtsp_url("http://camera.local"),
            Err(BootstrapError::InvalidUrl(_))
        ));
        assert!(validate_rtsp_url("rtsp://").is_err());
    }

    #[test]
    fn request_body_shape() {
        let body = serde_json::to_value(CreateSessionRequest {
            method: TransformMethod::WebRtcToRtsp,
            rtsp_url: "rtsp://host/live",
        })
        .expect("serialize");
        assert_eq!(body, json!({ "method": 1, "rtspUrl": "rtsp://host/live" }));
    }

    #[test]
    fn success_envelope_yields_peer() {
        let peer = parse_envelope(envelope(json!({ "code": 2000, "data": 5821, "msg": "ok" })))
            .expect("peer");
        assert_eq!(peer, PeerIdentity::from_number(5821));

        let peer = parse_envelope(envelope(json!({ "code": 2000, "data": "7710" }))).expect("peer");
        assert_eq!(peer.as_number(), Some(7710));
    }

    #[test]
    fn failure_envelope_carries_message() {
        match parse_envelope(envelope(json!({ "code": 5001, "msg": "stream unreachable" }))) {
            Err(BootstrapError::Rejected { code, message }) => {
                assert_eq!(code, 5001);
                assert_eq!(message, "stream unreachable");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn success_without_peer_is_an_error() {
        assert!(matches!(
            parse_envelope(envelope(json!({ "code": 2000, "data": null }))),
            Err(BootstrapError::MissingPeer)
        ));
    }
}
