use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Signaling transport is not connected")]
    Disconnected,

    #[error("Protocol error: {0}")]
    Protocol(#[from] pairline_shared::ProtocolError),
}
