//! Live signaling connections, keyed by participant id.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use pairline_shared::protocol::ServerMessage;
use pairline_shared::types::{ParticipantId, RoomId};

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub addr: Option<IpAddr>,
    /// Client supplied, never trusted.
    pub display_name: Option<String>,
    pub room: Option<RoomId>,
    tx: Outbound,
}

#[derive(Clone, Default)]
pub struct ParticipantRegistry {
    inner: Arc<RwLock<HashMap<ParticipantId, Participant>>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of connected participants afterwards.
    pub async fn register(&self, id: ParticipantId, addr: Option<IpAddr>, tx: Outbound) -> usize {
        let mut inner = self.inner.write().await;
        inner.insert(
            id,
            Participant {
                id,
                addr,
                display_name: None,
                room: None,
                tx,
            },
        );
        inner.len()
    }

    pub async fn unregister(&self, id: ParticipantId) -> Option<Participant> {
        self.inner.write().await.remove(&id)
    }

    pub async fn get(&self, id: ParticipantId) -> Option<Participant> {
        self.inner.read().await.get(&id).cloned()
    }

    pub async fn addr_of(&self, id: ParticipantId) -> Option<IpAddr> {
        self.inner.read().await.get(&id).and_then(|p| p.addr)
    }

    pub async fn room_of(&self, id: ParticipantId) -> Option<RoomId> {
        self.inner.read().await.get(&id).and_then(|p| p.room.clone())
    }

    /// Returns the room the participant was in before.
    pub async fn set_room(&self, id: ParticipantId, room: Option<RoomId>) -> Option<RoomId> {
        let mut inner = self.inner.write().await;
        let participant = inner.get_mut(&id)?;
        std::mem::replace(&mut participant.room, room)
    }

    /// Place a connected participant in `room`. False if it is already gone.
    pub async fn assign_room(&self, id: ParticipantId, room: RoomId) -> bool {
        match self.inner.write().await.get_mut(&id) {
            Some(participant) => {
                participant.room = Some(room);
                true
            }
            None => false,
        }
    }

    pub async fn set_display_name(&self, id: ParticipantId, name: Option<String>) {
        if let Some(participant) = self.inner.write().await.get_mut(&id) {
            participant.display_name = name;
        }
    }

    /// Every participant connected from `addr`.
    pub async fn connected_from(&self, addr: IpAddr) -> Vec<ParticipantId> {
        self.inner
            .read()
            .await
            .values()
            .filter(|p| p.addr == Some(addr))
            .map(|p| p.id)
            .collect()
    }

    /// `false` when the participant is gone or its writer has stopped.
    pub async fn send(&self, id: ParticipantId, message: ServerMessage) -> bool {
        let tx = match self.inner.read().await.get(&id) {
            Some(p) => p.tx.clone(),
            None => return false,
        };

        if tx.send(message).is_err() {
            debug!(peer = %id, "Dropping message for closed connection");
            return false;
        }
        true
    }

    pub async fn broadcast(&self, message: ServerMessage) {
        for participant in self.inner.read().await.values() {
            let _ = participant.tx.send(message.clone());
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}
