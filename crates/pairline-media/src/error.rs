use thiserror::Error;

/// Local capture failures. Each is terminal for the acquisition attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission to use camera or microphone was denied")]
    PermissionDenied,

    #[error("No matching capture device found")]
    DeviceUnavailable,

    #[error("Capture device is in use by another application")]
    DeviceBusy,

    #[error("Timed out waiting for local media")]
    Timeout,

    #[error("Media error: {0}")]
    Unknown(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Connection lost and reconnection attempts exhausted")]
    LinkLost,

    #[error("Another negotiation is already in flight")]
    NegotiationInProgress,

    #[error("Link is closed")]
    Closed,

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Failures reported by a peer connection backend.
#[derive(Error, Debug)]
pub enum RtcError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Invalid RTC configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Peer connection error: {0}")]
    Peer(String),
}

impl From<RtcError> for OrchestratorError {
    fn from(e: RtcError) -> Self {
        OrchestratorError::NegotiationFailed(e.to_string())
    }
}
