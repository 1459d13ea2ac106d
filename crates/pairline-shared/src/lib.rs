// Types and wire protocol shared by the signaling server and clients.

pub mod constants;
pub mod error;
pub mod ice;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use ice::{IceConfig, IceServer};
pub use protocol::{ClientMessage, IceCandidate, ServerMessage, SignalMessage, SignalPayload};
pub use types::{ChatMode, GroupSize, MessageId, ParticipantId, Preferences, RoomId};
