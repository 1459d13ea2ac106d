// Client-side signaling reliability: acknowledgments, de-duplication and
// an ordered outbox on top of an arbitrary transport.

pub mod ack;
pub mod client;
pub mod dedup;
pub mod error;
pub mod outbox;
pub mod transport;

pub use ack::{AckTracker, PendingSignal, RetryPolicy};
pub use client::SignalingClient;
pub use dedup::DedupWindow;
pub use error::NetError;
pub use outbox::Outbox;
pub use transport::{ChannelTransport, SignalTransport, TransportLink};
