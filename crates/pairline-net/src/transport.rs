//! The seam between the signaling client and whatever carries its frames.
//!
//! Socket plumbing (WebSocket framing, TLS, reconnecting the socket) lives
//! behind [`SignalTransport`]. [`ChannelTransport`] is the default
//! implementation: it hands messages to a tokio channel drained by the task
//! that owns the socket, and that task flips the shared connected flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use pairline_shared::protocol::ClientMessage;

use crate::error::NetError;

pub trait SignalTransport: Send {
    fn is_connected(&self) -> bool;

    fn send(&mut self, message: ClientMessage) -> Result<(), NetError>;
}

#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<ClientMessage>,
    connected: Arc<AtomicBool>,
}

/// Socket-side half of a [`ChannelTransport`].
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    pub connected: Arc<AtomicBool>,
}

impl TransportLink {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl ChannelTransport {
    /// Create a transport and the link the socket task drives.
    /// Starts disconnected.
    pub fn new() -> (Self, TransportLink) {
        let (tx, outgoing) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        (
            Self {
                tx,
                connected: connected.clone(),
            },
            TransportLink {
                outgoing,
                connected,
            },
        )
    }
}

impl SignalTransport for ChannelTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send(&mut self, message: ClientMessage) -> Result<(), NetError> {
        if !self.is_connected() {
            return Err(NetError::Disconnected);
        }
        self.tx.send(message).map_err(|_| NetError::Disconnected)
    }
}
