//! Local capture acquisition.
//!
//! Capture itself is platform code behind [`MediaDevices`]; this module only
//! decides what to ask for, how to fall back and how long to wait.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };

    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::AUDIO_VIDEO
    }
}

/// Handle to captured local media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    /// Stream id announced in the SDP
    pub stream_id: String,
    pub audio: bool,
    pub video: bool,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, constraints: MediaConstraints) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio: constraints.audio,
            video: constraints.video,
        }
    }
}

pub trait MediaDevices: Send + Sync + 'static {
    fn open(
        &self,
        constraints: MediaConstraints,
    ) -> impl Future<Output = Result<LocalMedia, MediaError>> + Send;

    /// Stop capture for a handle returned by [`MediaDevices::open`].
    fn release(&self, media: &LocalMedia);
}

/// Open local media, falling back to audio-only when no camera is present.
///
/// Permission and busy-device errors are returned immediately. The whole
/// acquisition, fallback included, is bounded by `timeout`.
pub async fn acquire_local_media<D: MediaDevices>(
    devices: &D,
    constraints: MediaConstraints,
    timeout: Duration,
) -> Result<LocalMedia, MediaError> {
    let acquisition = async {
        match devices.open(constraints).await {
            Err(MediaError::DeviceUnavailable) if constraints.video && constraints.audio => {
                info!("No camera found, falling back to audio-only");
                devices.open(MediaConstraints::AUDIO_ONLY).await
            }
            other => other,
        }
    };

    match tokio::time::timeout(timeout, acquisition).await {
        Ok(Ok(media)) => {
            debug!(
                stream = %media.stream_id,
                audio = media.audio,
                video = media.video,
                "Local media acquired"
            );
            Ok(media)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Local media acquisition failed");
            Err(e)
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Local media timed out");
            Err(MediaError::Timeout)
        }
    }
}
