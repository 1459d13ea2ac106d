//! Pending-acknowledgment tracking for outbound signals.
//!
//! The relay itself is fire-and-forget. Senders record every signal that
//! expects a receipt and periodically ask which ones timed out; whether a
//! timed-out signal is resent is up to the caller's [`RetryPolicy`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use pairline_shared::constants::ACK_TIMEOUT_MS;
use pairline_shared::protocol::SignalMessage;
use pairline_shared::types::{MessageId, RoomId};

#[derive(Debug, Clone)]
pub struct PendingSignal {
    pub message: SignalMessage,
    pub last_sent: Instant,
    /// Number of times the signal has been put on the wire.
    pub attempts: u32,
}

/// How many times a signal may be resent after its first send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_resends: u32,
}

impl RetryPolicy {
    pub const NEVER: Self = Self { max_resends: 0 };

    pub fn allows(&self, pending: &PendingSignal) -> bool {
        pending.attempts <= self.max_resends
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_resends: 2 }
    }
}

#[derive(Debug)]
pub struct AckTracker {
    timeout: Duration,
    pending: HashMap<MessageId, PendingSignal>,
}

impl AckTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    /// Start (or restart) the acknowledgment clock for a signal.
    pub fn track(&mut self, message: SignalMessage, now: Instant) {
        let attempts = self
            .pending
            .get(&message.id)
            .map(|p| p.attempts)
            .unwrap_or(0)
            + 1;

        self.pending.insert(
            message.id,
            PendingSignal {
                message,
                last_sent: now,
                attempts,
            },
        );
    }

    /// Put an expired signal back on the clock after resending it.
    pub fn requeue(&mut self, pending: PendingSignal, now: Instant) {
        self.pending.insert(
            pending.message.id,
            PendingSignal {
                last_sent: now,
                attempts: pending.attempts + 1,
                message: pending.message,
            },
        );
    }

    /// Returns `true` if the id was pending.
    pub fn acknowledge(&mut self, id: &MessageId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Remove and return every signal whose acknowledgment is overdue,
    /// oldest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingSignal> {
        let timeout = self.timeout;
        let expired_ids: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_sent) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut expired: Vec<PendingSignal> = expired_ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        expired.sort_by_key(|p| p.message.created_at);
        expired
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stop waiting on every signal sent into `room_id`. Returns how many.
    pub fn forget_room(&mut self, room_id: &RoomId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| &p.message.room_id != room_id);
        before - self.pending.len()
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(ACK_TIMEOUT_MS))
    }
}
