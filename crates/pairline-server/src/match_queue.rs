//! FIFO matchmaking.
//!
//! [`MatchQueue`] is plain data: arrival order in a `VecDeque`, entry data in
//! a [`QueueStore`]. [`MatchQueueHandle::spawn`] moves it into a dedicated
//! task and every operation goes through that task's command channel, so no
//! two enqueues can ever claim the same waiting participant.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use pairline_shared::types::{ParticipantId, Preferences};
use pairline_store::{QueueEntry, StoreError};

use crate::storage::{self, SharedDatabase};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub peer_id: ParticipantId,
    pub peer_preferences: Preferences,
    /// How long the peer had been waiting.
    pub waited: Duration,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Match queue is not running")]
    Closed,
}

// ---------------------------------------------------------------------------
// Backing stores
// ---------------------------------------------------------------------------

/// Where queue entry data lives. Order is kept by the queue itself.
pub trait QueueStore: Send + 'static {
    fn put(&mut self, entry: &QueueEntry) -> Result<(), StoreError>;
    fn get(&self, participant: ParticipantId) -> Result<Option<QueueEntry>, StoreError>;
    fn remove(&mut self, participant: ParticipantId) -> Result<bool, StoreError>;
    fn purge_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    entries: HashMap<ParticipantId, QueueEntry>,
}

impl QueueStore for MemoryQueueStore {
    fn put(&mut self, entry: &QueueEntry) -> Result<(), StoreError> {
        self.entries.insert(entry.participant_id, entry.clone());
        Ok(())
    }

    fn get(&self, participant: ParticipantId) -> Result<Option<QueueEntry>, StoreError> {
        Ok(self.entries.get(&participant).cloned())
    }

    fn remove(&mut self, participant: ParticipantId) -> Result<bool, StoreError> {
        Ok(self.entries.remove(&participant).is_some())
    }

    fn purge_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.enqueued_at >= cutoff);
        Ok(before - self.entries.len())
    }
}

pub struct SqliteQueueStore {
    db: SharedDatabase,
}

impl SqliteQueueStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Drop entries a previous run left behind. Their participants'
    /// connections died with that process.
    pub fn discard_leftovers(&self) -> Result<usize, StoreError> {
        storage::lock(&self.db)?.clear_queue_entries()
    }
}

impl QueueStore for SqliteQueueStore {
    fn put(&mut self, entry: &QueueEntry) -> Result<(), StoreError> {
        storage::lock(&self.db)?.put_queue_entry(entry)
    }

    fn get(&self, participant: ParticipantId) -> Result<Option<QueueEntry>, StoreError> {
        storage::lock(&self.db)?.get_queue_entry(participant)
    }

    fn remove(&mut self, participant: ParticipantId) -> Result<bool, StoreError> {
        storage::lock(&self.db)?.remove_queue_entry(participant)
    }

    fn purge_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        storage::lock(&self.db)?.purge_queue_entries_before(cutoff)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct MatchQueue<S: QueueStore> {
    order: VecDeque<ParticipantId>,
    store: S,
    /// Entries the store refused to take.
    fallback: HashMap<ParticipantId, QueueEntry>,
    ttl: chrono::Duration,
}

impl<S: QueueStore> MatchQueue<S> {
    pub fn new(store: S, ttl_secs: i64) -> Self {
        Self {
            order: VecDeque::new(),
            store,
            fallback: HashMap::new(),
            ttl: chrono::Duration::seconds(ttl_secs),
        }
    }

    /// Replace any previous entry of `participant`, append a fresh one and
    /// try to match it.
    pub fn enqueue(
        &mut self,
        participant: ParticipantId,
        preferences: Preferences,
        now: DateTime<Utc>,
    ) -> Option<MatchResult> {
        self.dequeue(participant);

        let entry = QueueEntry {
            participant_id: participant,
            preferences,
            enqueued_at: now,
        };
        if let Err(e) = self.store.put(&entry) {
            warn!(peer = %participant, error = %e, "Queue store rejected entry, keeping it in memory");
            self.fallback.insert(participant, entry);
        }
        self.order.push_back(participant);

        self.try_match(participant, now)
    }

    /// Safe to call for participants that are not queued.
    pub fn dequeue(&mut self, participant: ParticipantId) {
        self.order.retain(|p| *p != participant);
        self.forget(participant);
    }

    /// Match `caller` with the oldest live entry ahead of it.
    pub fn try_match(&mut self, caller: ParticipantId, now: DateTime<Utc>) -> Option<MatchResult> {
        while let Some(candidate) = self.order.pop_front() {
            if candidate == caller {
                // Everything older is gone: nobody to match with yet.
                self.order.push_back(candidate);
                return None;
            }

            let Some(entry) = self.entry(candidate).filter(|e| !self.is_expired(e, now)) else {
                debug!(peer = %candidate, "Discarding stale queue entry");
                self.forget(candidate);
                continue;
            };

            self.forget(candidate);
            self.dequeue(caller);

            let waited = (now - entry.enqueued_at).to_std().unwrap_or_default();
            info!(peer = %caller, matched = %candidate, waited_ms = waited.as_millis() as u64, "Matched");

            return Some(MatchResult {
                peer_id: candidate,
                peer_preferences: entry.preferences,
                waited,
            });
        }

        None
    }

    /// Drop every entry past its TTL. Returns how many were queued.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<ParticipantId> = self
            .order
            .iter()
            .copied()
            .filter(|p| self.entry(*p).map_or(true, |e| self.is_expired(&e, now)))
            .collect();

        for participant in &expired {
            self.dequeue(*participant);
        }

        // Rows left behind by a previous run.
        if let Err(e) = self.store.purge_before(now - self.ttl) {
            warn!(error = %e, "Failed to purge expired queue rows");
        }

        expired.len()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, participant: ParticipantId) -> bool {
        self.order.contains(&participant)
    }

    fn entry(&self, participant: ParticipantId) -> Option<QueueEntry> {
        if let Some(entry) = self.fallback.get(&participant) {
            return Some(entry.clone());
        }
        match self.store.get(participant) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(peer = %participant, error = %e, "Queue store read failed");
                None
            }
        }
    }

    fn forget(&mut self, participant: ParticipantId) {
        if self.fallback.remove(&participant).is_some() {
            return;
        }
        if let Err(e) = self.store.remove(participant) {
            warn!(peer = %participant, error = %e, "Queue store delete failed");
        }
    }

    fn is_expired(&self, entry: &QueueEntry, now: DateTime<Utc>) -> bool {
        now - entry.enqueued_at > self.ttl
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Commands sent *into* the queue task.
#[derive(Debug)]
enum QueueCommand {
    Enqueue {
        participant: ParticipantId,
        preferences: Preferences,
        reply: oneshot::Sender<Option<MatchResult>>,
    },
    Dequeue {
        participant: ParticipantId,
        reply: oneshot::Sender<()>,
    },
    Len(oneshot::Sender<usize>),
    PurgeExpired(oneshot::Sender<usize>),
}

#[derive(Clone)]
pub struct MatchQueueHandle {
    cmd_tx: mpsc::Sender<QueueCommand>,
}

impl MatchQueueHandle {
    /// Move `queue` into its own task. The task ends when every handle is
    /// dropped.
    pub fn spawn<S: QueueStore>(queue: MatchQueue<S>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(run(queue, cmd_rx));
        Self { cmd_tx }
    }

    pub async fn enqueue(
        &self,
        participant: ParticipantId,
        preferences: Preferences,
    ) -> Result<Option<MatchResult>, QueueError> {
        self.request(|reply| QueueCommand::Enqueue {
            participant,
            preferences,
            reply,
        })
        .await
    }

    pub async fn dequeue(&self, participant: ParticipantId) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Dequeue { participant, reply })
            .await
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        self.request(QueueCommand::Len).await
    }

    pub async fn purge_expired(&self) -> Result<usize, QueueError> {
        self.request(QueueCommand::PurgeExpired).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(reply))
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }
}

async fn run<S: QueueStore>(mut queue: MatchQueue<S>, mut cmd_rx: mpsc::Receiver<QueueCommand>) {
    while let Some(command) = cmd_rx.recv().await {
        match command {
            QueueCommand::Enqueue {
                participant,
                preferences,
                reply,
            } => {
                let result = queue.enqueue(participant, preferences, Utc::now());
                let _ = reply.send(result);
            }
            QueueCommand::Dequeue { participant, reply } => {
                queue.dequeue(participant);
                let _ = reply.send(());
            }
            QueueCommand::Len(reply) => {
                let _ = reply.send(queue.len());
            }
            QueueCommand::PurgeExpired(reply) => {
                let purged = queue.purge_expired(Utc::now());
                if purged > 0 {
                    info!(purged, "Purged expired queue entries");
                }
                let _ = reply.send(purged);
            }
        }
    }

    debug!("Match queue task stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pairline_store::Database;

    use super::*;

    fn queue() -> MatchQueue<MemoryQueueStore> {
        MatchQueue::new(MemoryQueueStore::default(), 600)
    }

    /// Refuses every write.
    struct BrokenStore;

    impl QueueStore for BrokenStore {
        fn put(&mut self, _: &QueueEntry) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn get(&self, _: ParticipantId) -> Result<Option<QueueEntry>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn remove(&mut self, _: ParticipantId) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn purge_before(&mut self, _: DateTime<Utc>) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_second_enqueue_matches_first() {
        let mut queue = queue();
        let (x, y) = (ParticipantId::new(), ParticipantId::new());
        let t0 = Utc::now();

        assert!(queue.enqueue(x, Preferences::video(), t0).is_none());
        let result = queue
            .enqueue(y, Preferences::video(), t0 + chrono::Duration::seconds(3))
            .unwrap();

        assert_eq!(result.peer_id, x);
        assert_eq!(result.peer_preferences, Preferences::video());
        assert_eq!(result.waited, Duration::from_secs(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_never_matched_with_self() {
        let mut queue = queue();
        let x = ParticipantId::new();
        let now = Utc::now();

        assert!(queue.enqueue(x, Preferences::video(), now).is_none());
        // Re-enqueue replaces the entry rather than pairing x with x.
        assert!(queue.enqueue(x, Preferences::text(), now).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.try_match(x, now).is_none());
        assert!(queue.contains(x));
    }

    #[test]
    fn test_dequeue_absent_is_noop() {
        let mut queue = queue();
        queue.dequeue(ParticipantId::new());
        assert!(queue.is_empty());

        let x = ParticipantId::new();
        queue.enqueue(x, Preferences::video(), Utc::now());
        queue.dequeue(x);
        queue.dequeue(x);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = queue();
        let now = Utc::now();
        let (a, b) = (ParticipantId::new(), ParticipantId::new());
        queue.order.push_back(a);
        queue.store.put(&QueueEntry::new(a, Preferences::video())).unwrap();
        queue.order.push_back(b);
        queue.store.put(&QueueEntry::new(b, Preferences::video())).unwrap();

        let result = queue.enqueue(ParticipantId::new(), Preferences::video(), now).unwrap();
        assert_eq!(result.peer_id, a);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(b));
    }

    #[test]
    fn test_expired_and_missing_entries_skipped() {
        let mut queue = MatchQueue::new(MemoryQueueStore::default(), 60);
        let now = Utc::now();
        let (stale, ghost, fresh, caller) = (
            ParticipantId::new(),
            ParticipantId::new(),
            ParticipantId::new(),
            ParticipantId::new(),
        );

        queue.enqueue(stale, Preferences::video(), now - chrono::Duration::seconds(120));
        queue.order.push_back(ghost);
        queue.enqueue(fresh, Preferences::video(), now);

        // `stale` matched nobody earlier, `ghost` has no backing data.
        let result = queue.enqueue(caller, Preferences::video(), now).unwrap();
        assert_eq!(result.peer_id, fresh);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let mut queue = MatchQueue::new(MemoryQueueStore::default(), 60);
        let now = Utc::now();
        let old = ParticipantId::new();
        queue.enqueue(old, Preferences::video(), now - chrono::Duration::seconds(61));

        assert_eq!(queue.purge_expired(now), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.store.get(old).unwrap(), None);
    }

    #[test]
    fn test_store_failure_falls_back_to_memory() {
        let mut queue = MatchQueue::new(BrokenStore, 600);
        let (x, y) = (ParticipantId::new(), ParticipantId::new());
        let now = Utc::now();

        assert!(queue.enqueue(x, Preferences::video(), now).is_none());
        let result = queue.enqueue(y, Preferences::text(), now).unwrap();
        assert_eq!(result.peer_id, x);
        assert!(queue.fallback.is_empty());
    }

    #[test]
    fn test_sqlite_backing_store() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let mut queue = MatchQueue::new(SqliteQueueStore::new(db.clone()), 600);
        let (x, y) = (ParticipantId::new(), ParticipantId::new());

        queue.enqueue(x, Preferences::text(), Utc::now());
        assert!(db.lock().unwrap().get_queue_entry(x).unwrap().is_some());

        let result = queue.enqueue(y, Preferences::video(), Utc::now()).unwrap();
        assert_eq!(result.peer_preferences, Preferences::text());
        assert!(db.lock().unwrap().get_queue_entry(x).unwrap().is_none());
        assert!(db.lock().unwrap().get_queue_entry(y).unwrap().is_none());
    }

    #[test]
    fn test_leftovers_from_previous_run_discarded() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let mut previous = MatchQueue::new(SqliteQueueStore::new(db.clone()), 600);
        assert!(previous
            .enqueue(ParticipantId::new(), Preferences::video(), Utc::now())
            .is_none());
        drop(previous);

        let store = SqliteQueueStore::new(db);
        assert_eq!(store.discard_leftovers().unwrap(), 1);
        assert_eq!(store.discard_leftovers().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_actor_serializes_concurrent_enqueues() {
        let handle = MatchQueueHandle::spawn(queue());
        let waiting = ParticipantId::new();
        assert_eq!(handle.enqueue(waiting, Preferences::video()).await, Ok(None));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.enqueue(ParticipantId::new(), Preferences::video()).await
            }));
        }

        let mut matched_waiting = 0;
        let mut matches = 0;
        for task in tasks {
            if let Some(result) = task.await.unwrap().unwrap() {
                matches += 1;
                if result.peer_id == waiting {
                    matched_waiting += 1;
                }
            }
        }

        // 11 participants pair up into 5 matches, `waiting` in exactly one.
        assert_eq!(matched_waiting, 1);
        assert_eq!(matches, 5);
        assert_eq!(handle.len().await, Ok(1));
    }

    #[tokio::test]
    async fn test_actor_dequeue_and_purge() {
        let handle = MatchQueueHandle::spawn(queue());
        let x = ParticipantId::new();
        handle.enqueue(x, Preferences::video()).await.unwrap();
        handle.dequeue(x).await.unwrap();
        handle.dequeue(x).await.unwrap();

        assert_eq!(handle.len().await, Ok(0));
        assert_eq!(handle.purge_expired().await, Ok(0));
    }
}
