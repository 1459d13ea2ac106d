//! Duplicate suppression for relayed signals.

use std::collections::{HashSet, VecDeque};

use pairline_shared::constants::DEDUP_WINDOW;
use pairline_shared::types::MessageId;

/// Bounded set of recently seen message ids.
///
/// Once `capacity` ids are held, the oldest one is forgotten for every new
/// id recorded.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    capacity: usize,
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `id`. Returns `true` the first time an id is seen.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }

        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut window = DedupWindow::default();
        let id = MessageId::new();

        assert!(window.insert(id));
        assert!(!window.insert(id));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = DedupWindow::new(3);
        let ids: Vec<_> = (0..4).map(|_| MessageId::new()).collect();
        for id in &ids {
            assert!(window.insert(*id));
        }

        assert_eq!(window.len(), 3);
        assert!(!window.contains(&ids[0]));
        assert!(window.contains(&ids[3]));
        // Forgotten ids are accepted again.
        assert!(window.insert(ids[0]));
    }
}
