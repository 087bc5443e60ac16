//! Local media source management
//!
//! Acquires and releases local capture sources. A source is independent of
//! any session; attaching it to a negotiation engine is a separate step
//! driven through the session.

use crate::config::MediaConfig;
use crate::error::SessionError;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Camera facing preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    #[default]
    Environment,
}

/// What to capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
    pub facing_mode: FacingMode,
}

impl Default for MediaConstraints {
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

impl From<&MediaConfig> for MediaConstraints {
    fn from(config: &MediaConfig) -> Self {
        Self {
            video: config.video,
            audio: config.audio,
            width: config.width,
            height: config.height,
            facing_mode: config.facing_mode,
        }
    }
}

impl MediaConstraints {
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.video {
            kinds.push(MediaKind::Video);
        }
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        kinds
    }
}

/// A live capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSourceHandle {
    pub id: Uuid,
    pub kinds: Vec<MediaKind>,
}

impl MediaSourceHandle {
    pub fn new(kinds: Vec<MediaKind>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kinds,
        }
    }
}

/// A capture device that can be opened for a set of constraints
pub trait CaptureDevice: Send + Sync {
    /// Open the device. Returns the media kinds actually granted.
    fn open(&self, constraints: &MediaConstraints) -> Result<Vec<MediaKind>, SessionError>;

    /// Stop capturing for a previously opened source
    fn close(&self, _id: Uuid) {}
}

/// Device that grants whatever is requested without capturing anything.
/// Tracks attached from it stay silent until samples are written.
pub struct SyntheticDevice;

impl CaptureDevice for SyntheticDevice {
    fn open(&self, constraints: &MediaConstraints) -> Result<Vec<MediaKind>, SessionError> {
        Ok(constraints.kinds())
    }
}

/// Tracks acquired capture sources
pub struct LocalMediaManager {
    device: Box<dyn CaptureDevice>,
    active: HashMap<Uuid, MediaSourceHandle>,
}

impl LocalMediaManager {
    pub fn new(device: Box<dyn CaptureDevice>) -> Self {
        Self {
            device,
            active: HashMap::new(),
        }
    }

    /// Open the device; fails with `DeviceUnavailable`
    pub fn acquire(&mut self, constraints: &MediaConstraints) -> Result<MediaSourceHandle, SessionError> {
        if constraints.kinds().is_empty() {
            return Err(SessionError::DeviceUnavailable(
                "constraints request neither audio nor video".to_string(),
            ));
        }

        let kinds = self.device.open(constraints)?;
        if kinds.is_empty() {
            return Err(SessionError::DeviceUnavailable("device granted no tracks".to_string()));
        }

        let handle = MediaSourceHandle::new(kinds);
        info!(
            "Acquired local media {} ({}x{}, {:?})",
            handle.id, constraints.width, constraints.height, handle.kinds
        );
        self.active.insert(handle.id, handle.clone());
        Ok(handle)
    }

    /// Stop a source. Releasing twice is a no-op; returns whether anything
    /// was released.
    pub fn release(&mut self, handle: &MediaSourceHandle) -> bool {
        match self.active.remove(&handle.id) {
            Some(_) => {
                self.device.close(handle.id);
                info!("Released local media {}", handle.id);
                true
            }
            None => {
                debug!("Local media {} already released", handle.id);
                false
            }
        }
    }

    pub fn release_all(&mut self) {
        let ids: Vec<Uuid> = self.active.keys().copied().collect();
        for id in ids {
            self.active.remove(&id);
            self.device.close(id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
