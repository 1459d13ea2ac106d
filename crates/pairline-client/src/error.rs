use thiserror::Error;

use pairline_media::{OrchestratorError, RtcError};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Could not reach the server: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server responded with status {0}")]
    Status(u16),

    #[error("Not in a room")]
    NotInRoom,

    #[error("Session is not running")]
    Closed,

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Rtc(#[from] RtcError),
}
