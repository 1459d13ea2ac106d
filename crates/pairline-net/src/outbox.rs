//! Local queue for messages produced while the signaling socket is down.

use std::collections::VecDeque;

use tracing::warn;

use pairline_shared::protocol::ClientMessage;

const DEFAULT_OUTBOX_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct Outbox {
    capacity: usize,
    queue: VecDeque<ClientMessage>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: VecDeque::new(),
        }
    }

    /// Queue a message. When full, the oldest message is dropped.
    pub fn push(&mut self, message: ClientMessage) {
        if self.queue.len() >= self.capacity {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(?dropped, "Outbox full, dropping oldest message");
            }
        }
        self.queue.push_back(message);
    }

    /// Put a message back at the head, e.g. after a failed flush.
    pub fn push_front(&mut self, message: ClientMessage) {
        self.queue.push_front(message);
    }

    pub fn pop(&mut self) -> Option<ClientMessage> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Keep only the messages `keep` accepts, in their original order.
    /// Returns how many were dropped.
    pub fn retain(&mut self, keep: impl FnMut(&ClientMessage) -> bool) -> usize {
        let before = self.queue.len();
        self.queue.retain(keep);
        before - self.queue.len()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairline_shared::types::RoomId;

    #[test]
    fn test_fifo_order() {
        let mut outbox = Outbox::default();
        outbox.push(ClientMessage::LeaveQueue);
        outbox.push(ClientMessage::LeaveRoom {
            room_id: RoomId::from("room-1"),
        });

        assert_eq!(outbox.pop(), Some(ClientMessage::LeaveQueue));
        assert!(matches!(outbox.pop(), Some(ClientMessage::LeaveRoom { .. })));
        assert!(outbox.pop().is_none());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut outbox = Outbox::new(1);
        outbox.push(ClientMessage::LeaveQueue);
        outbox.push(ClientMessage::LeaveRoom {
            room_id: RoomId::from("room-1"),
        });

        assert_eq!(outbox.len(), 1);
        assert!(matches!(outbox.pop(), Some(ClientMessage::LeaveRoom { .. })));
    }
}
