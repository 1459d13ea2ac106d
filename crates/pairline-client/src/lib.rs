//! Client-side session context for Pairline.
//!
//! A [`Session`] owns the signaling client, one orchestrator per peer link
//! and the local media handle for as long as the user stays connected.
//! [`SessionHandle::spawn`] runs it as a task fed by the socket reader.

pub mod api;
pub mod error;
pub mod events;
pub mod session;

pub use api::{fetch_ice_config, fetch_server_info, rtc_factory, ServerInfo};
pub use error::ClientError;
pub use events::SessionEvent;
pub use session::{LinkEvent, LinkKey, Session, SessionCommand, SessionHandle};
