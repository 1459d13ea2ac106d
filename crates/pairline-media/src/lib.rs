// Peer link orchestration: local media, negotiation, recovery and link
// quality for one remote participant at a time.

pub mod config;
pub mod error;
pub mod handle;
pub mod ice;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod quality;
pub mod reconnect;
pub mod rtc;

pub use config::{OrchestratorSettings, RtcConfig};
pub use error::{MediaError, OrchestratorError, RtcError};
pub use handle::{OrchestratorCommand, OrchestratorHandle};
pub use media::{acquire_local_media, LocalMedia, MediaConstraints, MediaDevices};
pub use orchestrator::{ConnectionState, Orchestrator, OrchestratorEvent, Role};
pub use peer::{PeerConnection, PeerConnectionFactory, RemoteTrack, TrackKind};
pub use quality::{EncodingBounds, LinkQuality, LinkStats};
pub use rtc::{RtcPeer, RtcPeerFactory};
