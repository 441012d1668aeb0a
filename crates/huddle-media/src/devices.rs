//! Capture runtime seam.

use async_trait::async_trait;

use huddle_shared::types::DeviceKind;
use huddle_shared::MediaAccessError;

use crate::track::LocalTrack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
    pub is_default: bool,
}

/// What to capture for the camera/microphone stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub video_device: Option<String>,
    pub audio_device: Option<String>,
}

impl MediaConstraints {
    pub fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }

    /// Camera-only request for a specific device.
    pub fn video_only(device: Option<String>) -> Self {
        Self {
            video: true,
            video_device: device,
            ..Self::default()
        }
    }

    /// Microphone-only request for a specific device.
    pub fn audio_only(device: Option<String>) -> Self {
        Self {
            audio: true,
            audio_device: device,
            ..Self::default()
        }
    }
}

/// Device enumeration and capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaAccessError>;

    /// Capture camera and/or microphone. Returns one track per requested
    /// kind; an empty request yields no tracks.
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<LocalTrack>, MediaAccessError>;

    /// Capture a display surface as a `Screen` track.
    async fn get_display_media(&self) -> Result<LocalTrack, MediaAccessError>;
}
