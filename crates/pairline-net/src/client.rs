//! Reliable signaling client.
//!
//! Wraps a [`SignalTransport`] with the best-effort reliability the relay
//! itself does not provide: message ids and acknowledgment tracking on the
//! way out, duplicate suppression and auto-acks on the way in, and an
//! ordered outbox while the transport is down.

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use pairline_shared::protocol::{ClientMessage, ServerMessage, SignalMessage, SignalPayload};
use pairline_shared::types::{MessageId, ParticipantId, RoomId};

use crate::ack::{AckTracker, RetryPolicy};
use crate::dedup::DedupWindow;
use crate::error::NetError;
use crate::outbox::Outbox;
use crate::transport::SignalTransport;

pub struct SignalingClient<T: SignalTransport> {
    transport: T,
    local_id: Option<ParticipantId>,
    outbox: Outbox,
    acks: AckTracker,
    seen: DedupWindow,
}

impl<T: SignalTransport> SignalingClient<T> {
    pub fn new(transport: T) -> Self {
        Self::with_parts(transport, AckTracker::default(), DedupWindow::default())
    }

    pub fn with_parts(transport: T, acks: AckTracker, seen: DedupWindow) -> Self {
        Self {
            transport,
            local_id: None,
            outbox: Outbox::default(),
            acks,
            seen,
        }
    }

    /// Our participant id, known once the server's `welcome` arrived.
    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local_id
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send a control message, or queue it if the transport is down.
    pub fn send(&mut self, message: ClientMessage) {
        if !self.outbox.is_empty() {
            // Keep original order: anything queued earlier goes first.
            self.flush();
        }

        if !self.outbox.is_empty() || !self.transport.is_connected() {
            trace!("Transport down, queueing outbound message");
            self.outbox.push(message);
            return;
        }

        if let Err(e) = self.transport.send(message.clone()) {
            debug!(error = %e, "Send failed, queueing outbound message");
            self.outbox.push(message);
        }
    }

    /// Wrap `payload` in a new signal, track its acknowledgment and send it.
    pub fn send_signal(
        &mut self,
        room_id: RoomId,
        target: Option<ParticipantId>,
        payload: SignalPayload,
    ) -> MessageId {
        let message = SignalMessage::new(room_id, target, payload);
        let id = message.id;

        if message.payload.requires_ack() {
            self.acks.track(message.clone(), Instant::now());
        }
        self.send(ClientMessage::Signal(message));
        id
    }

    /// Transport (re)connected: flush the outbox in original order.
    /// Returns the number of messages written.
    pub fn flush(&mut self) -> usize {
        let mut sent = 0;
        while self.transport.is_connected() {
            let Some(message) = self.outbox.pop() else {
                break;
            };
            if let Err(e) = self.transport.send(message.clone()) {
                debug!(error = %e, "Flush interrupted");
                self.outbox.push_front(message);
                break;
            }
            sent += 1;
        }

        if sent > 0 {
            debug!(sent, remaining = self.outbox.len(), "Flushed outbox");
        }
        sent
    }

    /// Process a message from the server.
    ///
    /// Returns the message if application logic should see it. Acks are
    /// consumed here; duplicate signals are acknowledged again (the first
    /// ack may have been lost) but not dispatched.
    pub fn receive(&mut self, message: ServerMessage) -> Option<ServerMessage> {
        match message {
            ServerMessage::Welcome { participant_id } => {
                self.local_id = Some(participant_id);
                Some(ServerMessage::Welcome { participant_id })
            }

            ServerMessage::Signal(signal) => {
                if let SignalPayload::Ack { ack_of } = &signal.payload {
                    if !self.acks.acknowledge(ack_of) {
                        trace!(id = %ack_of, "Ack for unknown or settled signal");
                    }
                    return None;
                }

                if signal.sender.is_some() {
                    let ack = signal.ack();
                    self.send(ClientMessage::Signal(ack));
                }

                if !self.seen.insert(signal.id) {
                    debug!(
                        id = %signal.id,
                        kind = signal.payload.kind(),
                        "Dropping duplicate signal"
                    );
                    return None;
                }

                Some(ServerMessage::Signal(signal))
            }

            other => Some(other),
        }
    }

    /// Decode a text frame from the socket and pass it to [`Self::receive`].
    pub fn receive_text(&mut self, text: &str) -> Result<Option<ServerMessage>, NetError> {
        let message = ServerMessage::from_json(text)?;
        Ok(self.receive(message))
    }

    /// Check acknowledgment deadlines.
    ///
    /// Signals the policy allows are resent with their original id (so the
    /// receiver de-duplicates them); the rest are given up and returned.
    pub fn poll_timeouts(&mut self, policy: RetryPolicy) -> Vec<SignalMessage> {
        let now = Instant::now();
        let mut given_up = Vec::new();

        for pending in self.acks.take_expired(now) {
            if policy.allows(&pending) {
                debug!(
                    id = %pending.message.id,
                    kind = pending.message.payload.kind(),
                    attempt = pending.attempts + 1,
                    "Resending unacknowledged signal"
                );
                let message = pending.message.clone();
                self.acks.requeue(pending, now);
                self.send(ClientMessage::Signal(message));
            } else {
                warn!(
                    id = %pending.message.id,
                    kind = pending.message.payload.kind(),
                    attempts = pending.attempts,
                    "Signal was never acknowledged"
                );
                given_up.push(pending.message);
            }
        }

        given_up
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.pending_len()
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Drop everything still owed to a room we left: pending acks and
    /// queued signals. Queued control messages are kept.
    pub fn forget_room(&mut self, room_id: &RoomId) {
        let acks = self.acks.forget_room(room_id);
        let signals = self.outbox.retain(|message| {
            !matches!(message, ClientMessage::Signal(signal) if &signal.room_id == room_id)
        });
        if acks + signals > 0 {
            debug!(room = %room_id, acks, signals, "Forgot signals for left room");
        }
    }
}
