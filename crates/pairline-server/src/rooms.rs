//! Room membership and initiator assignment.
//!
//! Pair rooms hold exactly two members and hand out the initiator role once
//! per fill. Group rooms (ids starting with `group-`) hold up to
//! `max_group_size` members; the newest joiner offers to everyone already
//! there. A room disappears from the registry when its last member leaves.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use pairline_shared::types::{ParticipantId, RoomId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room {0} is full")]
    Full(RoomId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First member of a pair room.
    Waiting,
    /// The pair room just filled. Emitted once per fill.
    Filled {
        initiator: ParticipantId,
        receiver: ParticipantId,
    },
    /// The participant was already in the room; nothing changed.
    AlreadyMember,
    /// Group room; `existing` are the members the joiner must offer to.
    GroupJoined { existing: Vec<ParticipantId> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub remaining: Vec<ParticipantId>,
    /// The room lost its last member and was removed.
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Waiting,
    Active,
    Closed,
}

#[derive(Debug)]
struct Room {
    id: RoomId,
    /// In arrival order.
    members: Vec<ParticipantId>,
    phase: RoomPhase,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            members: Vec::new(),
            phase: RoomPhase::Waiting,
        }
    }

    fn join(
        &mut self,
        participant: ParticipantId,
        max_group_size: usize,
    ) -> Result<JoinOutcome, RoomError> {
        if self.members.contains(&participant) {
            return Ok(JoinOutcome::AlreadyMember);
        }

        if self.id.is_group() {
            if self.members.len() >= max_group_size {
                return Err(RoomError::Full(self.id.clone()));
            }
            let existing = self.members.clone();
            self.members.push(participant);
            self.phase = if self.members.len() > 1 {
                RoomPhase::Active
            } else {
                RoomPhase::Waiting
            };
            return Ok(JoinOutcome::GroupJoined { existing });
        }

        match self.members.len() {
            0 => {
                self.members.push(participant);
                self.phase = RoomPhase::Waiting;
                Ok(JoinOutcome::Waiting)
            }
            1 => {
                self.members.push(participant);
                self.phase = RoomPhase::Active;
                Ok(JoinOutcome::Filled {
                    initiator: self.members[0],
                    receiver: participant,
                })
            }
            _ => Err(RoomError::Full(self.id.clone())),
        }
    }

    fn leave(&mut self, participant: ParticipantId) -> Option<Vec<ParticipantId>> {
        let before = self.members.len();
        self.members.retain(|m| *m != participant);
        if self.members.len() == before {
            return None;
        }

        self.phase = match self.members.len() {
            0 => RoomPhase::Closed,
            1 => RoomPhase::Waiting,
            _ => RoomPhase::Active,
        };
        Some(self.members.clone())
    }
}

#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>>,
    max_group_size: usize,
}

impl RoomRegistry {
    pub fn new(max_group_size: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            max_group_size,
        }
    }

    /// Join `room_id`, creating the room if it does not exist yet.
    pub async fn join(
        &self,
        room_id: &RoomId,
        participant: ParticipantId,
    ) -> Result<JoinOutcome, RoomError> {
        loop {
            let handle = self.get_or_create(room_id).await;
            let mut room = handle.lock().await;

            // Closed between the map lookup and taking the room lock.
            if room.phase == RoomPhase::Closed {
                drop(room);
                self.forget(room_id, &handle).await;
                continue;
            }

            let outcome = room.join(participant, self.max_group_size)?;
            match &outcome {
                JoinOutcome::Filled { initiator, receiver } => info!(
                    room = %room_id,
                    initiator = %initiator,
                    receiver = %receiver,
                    "Room filled"
                ),
                JoinOutcome::AlreadyMember => {
                    debug!(room = %room_id, peer = %participant, "Repeated join ignored")
                }
                _ => debug!(
                    room = %room_id,
                    peer = %participant,
                    members = room.members.len(),
                    "Joined room"
                ),
            }
            return Ok(outcome);
        }
    }

    /// Leave `room_id`. `None` when the participant was not a member.
    pub async fn leave(
        &self,
        room_id: &RoomId,
        participant: ParticipantId,
    ) -> Option<LeaveOutcome> {
        let room = self.rooms.read().await.get(room_id).cloned()?;

        let remaining = {
            let mut guard = room.lock().await;
            guard.leave(participant)?
        };

        let closed = remaining.is_empty();
        if closed {
            self.forget(room_id, &room).await;
            info!(room = %room_id, "Removed empty room");
        } else {
            debug!(room = %room_id, peer = %participant, remaining = remaining.len(), "Left room");
        }

        Some(LeaveOutcome { remaining, closed })
    }

    /// Place `participant` in the fullest group room that still has space,
    /// or a new one.
    pub async fn open_group_room(&self, participant: ParticipantId) -> (RoomId, JoinOutcome) {
        loop {
            let room_id = self
                .fullest_open_group_room()
                .await
                .unwrap_or_else(RoomId::new_group);

            match self.join(&room_id, participant).await {
                Ok(outcome) => return (room_id, outcome),
                // Someone else took the last seat; look again.
                Err(RoomError::Full(_)) => continue,
            }
        }
    }

    pub async fn members(&self, room_id: &RoomId) -> Option<Vec<ParticipantId>> {
        let room = self.rooms.read().await.get(room_id).cloned()?;
        let members = room.lock().await.members.clone();
        Some(members)
    }

    #[cfg(test)]
    pub async fn phase(&self, room_id: &RoomId) -> RoomPhase {
        let Some(room) = self.rooms.read().await.get(room_id).cloned() else {
            return RoomPhase::Closed;
        };
        let phase = room.lock().await.phase;
        phase
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn get_or_create(&self, room_id: &RoomId) -> Arc<Mutex<Room>> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return room.clone();
        }

        self.rooms
            .write()
            .await
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id.clone()))))
            .clone()
    }

    /// Remove `room` from the map unless the id was already reused.
    async fn forget(&self, room_id: &RoomId, room: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|r| Arc::ptr_eq(r, room)) {
            rooms.remove(room_id);
        }
    }

    async fn fullest_open_group_room(&self) -> Option<RoomId> {
        let candidates: Vec<(RoomId, Arc<Mutex<Room>>)> = self
            .rooms
            .read()
            .await
            .iter()
            .filter(|(id, _)| id.is_group())
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect();

        let mut best: Option<(RoomId, usize)> = None;
        for (id, room) in candidates {
            let room = room.lock().await;
            let size = room.members.len();
            if room.phase == RoomPhase::Closed || size >= self.max_group_size {
                continue;
            }
            if best.as_ref().map_or(true, |(_, best_size)| size > *best_size) {
                best = Some((id, size));
            }
        }
        best.map(|(id, _)| id)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(pairline_shared::constants::DEFAULT_MAX_GROUP_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_room_fills_once() {
        let rooms = RoomRegistry::default();
        let room = RoomId::new_pair();
        let (x, y) = (ParticipantId::new(), ParticipantId::new());

        assert_eq!(rooms.join(&room, x).await, Ok(JoinOutcome::Waiting));
        assert_eq!(rooms.phase(&room).await, RoomPhase::Waiting);
        assert_eq!(
            rooms.join(&room, y).await,
            Ok(JoinOutcome::Filled {
                initiator: x,
                receiver: y
            })
        );
        assert_eq!(rooms.phase(&room).await, RoomPhase::Active);

        // Re-joining an active room does not fill it again.
        assert_eq!(rooms.join(&room, y).await, Ok(JoinOutcome::AlreadyMember));
        assert_eq!(rooms.join(&room, x).await, Ok(JoinOutcome::AlreadyMember));
    }

    #[tokio::test]
    async fn test_third_member_rejected() {
        let rooms = RoomRegistry::default();
        let room = RoomId::new_pair();
        rooms.join(&room, ParticipantId::new()).await.unwrap();
        rooms.join(&room, ParticipantId::new()).await.unwrap();

        assert_eq!(
            rooms.join(&room, ParticipantId::new()).await,
            Err(RoomError::Full(room.clone()))
        );
    }

    #[tokio::test]
    async fn test_leave_returns_to_waiting_then_closes() {
        let rooms = RoomRegistry::default();
        let room = RoomId::new_pair();
        let (x, y, z) = (ParticipantId::new(), ParticipantId::new(), ParticipantId::new());
        rooms.join(&room, x).await.unwrap();
        rooms.join(&room, y).await.unwrap();

        let outcome = rooms.leave(&room, x).await.unwrap();
        assert_eq!(outcome.remaining, vec![y]);
        assert!(!outcome.closed);
        assert_eq!(rooms.phase(&room).await, RoomPhase::Waiting);

        // A new fill is a new transition; the remaining member is now first.
        assert_eq!(
            rooms.join(&room, z).await,
            Ok(JoinOutcome::Filled {
                initiator: y,
                receiver: z
            })
        );

        rooms.leave(&room, y).await.unwrap();
        let outcome = rooms.leave(&room, z).await.unwrap();
        assert!(outcome.closed);
        assert_eq!(rooms.room_count().await, 0);
        assert_eq!(rooms.phase(&room).await, RoomPhase::Closed);
    }

    #[tokio::test]
    async fn test_leave_when_absent_is_noop() {
        let rooms = RoomRegistry::default();
        let room = RoomId::new_pair();
        assert!(rooms.leave(&room, ParticipantId::new()).await.is_none());

        rooms.join(&room, ParticipantId::new()).await.unwrap();
        assert!(rooms.leave(&room, ParticipantId::new()).await.is_none());
        assert_eq!(rooms.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_group_room_lists_existing_members() {
        let rooms = RoomRegistry::new(3);
        let room = RoomId::from("group-lobby");
        let members: Vec<_> = (0..3).map(|_| ParticipantId::new()).collect();

        for (i, member) in members.iter().enumerate() {
            assert_eq!(
                rooms.join(&room, *member).await,
                Ok(JoinOutcome::GroupJoined {
                    existing: members[..i].to_vec()
                })
            );
        }

        assert_eq!(
            rooms.join(&room, ParticipantId::new()).await,
            Err(RoomError::Full(room.clone()))
        );
    }

    #[tokio::test]
    async fn test_open_group_room_prefers_fullest() {
        let rooms = RoomRegistry::new(3);
        let (a, b, c, d) = (
            ParticipantId::new(),
            ParticipantId::new(),
            ParticipantId::new(),
            ParticipantId::new(),
        );

        let (first, _) = rooms.open_group_room(a).await;
        assert!(first.is_group());
        let (second, outcome) = rooms.open_group_room(b).await;
        assert_eq!(second, first);
        assert_eq!(outcome, JoinOutcome::GroupJoined { existing: vec![a] });

        rooms.open_group_room(c).await;
        let (overflow, outcome) = rooms.open_group_room(d).await;
        assert_ne!(overflow, first);
        assert_eq!(outcome, JoinOutcome::GroupJoined { existing: vec![] });
    }

    #[tokio::test]
    async fn test_concurrent_joins_fill_exactly_once() {
        let rooms = RoomRegistry::default();
        let room = RoomId::new_pair();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let rooms = rooms.clone();
            let room = room.clone();
            tasks.push(tokio::spawn(async move {
                rooms.join(&room, ParticipantId::new()).await
            }));
        }

        let mut filled = 0;
        let mut full = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(JoinOutcome::Filled { .. }) => filled += 1,
                Err(RoomError::Full(_)) => full += 1,
                _ => {}
            }
        }
        assert_eq!(filled, 1);
        assert_eq!(full, 6);
    }
}
