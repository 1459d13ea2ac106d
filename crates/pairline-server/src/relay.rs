//! Forwards signaling messages between members of a room.
//!
//! The server never looks inside the payload. It checks membership, stamps
//! the sender and fans the message out to everyone else in the room, or to
//! the single target a group-room message names.

use tracing::{debug, warn};

use pairline_shared::protocol::{ServerMessage, SignalMessage};
use pairline_shared::types::ParticipantId;

use crate::participants::ParticipantRegistry;
use crate::rooms::RoomRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Handed to this many connections. Zero is not an error.
    Delivered(usize),
    /// The sender is not in the room it addressed.
    NotMember,
    /// The named target is not in the room.
    UnknownTarget,
}

#[derive(Clone)]
pub struct SignalRelay {
    rooms: RoomRegistry,
    participants: ParticipantRegistry,
}

impl SignalRelay {
    pub fn new(rooms: RoomRegistry, participants: ParticipantRegistry) -> Self {
        Self {
            rooms,
            participants,
        }
    }

    pub async fn relay(&self, mut message: SignalMessage, from: ParticipantId) -> RelayOutcome {
        let room_id = message.room_id.clone();
        let members = self.rooms.members(&room_id).await.unwrap_or_default();

        if !members.contains(&from) {
            warn!(
                room = %room_id,
                peer = %from,
                kind = message.payload.kind(),
                "Signal from non-member dropped"
            );
            return RelayOutcome::NotMember;
        }

        let recipients: Vec<ParticipantId> = match message.target {
            Some(target) if target == from => Vec::new(),
            Some(target) if members.contains(&target) => vec![target],
            Some(target) => {
                warn!(room = %room_id, peer = %from, target = %target, "Signal target not in room");
                return RelayOutcome::UnknownTarget;
            }
            None => members.into_iter().filter(|m| *m != from).collect(),
        };

        message.sender = Some(from);

        let mut delivered = 0;
        for recipient in &recipients {
            if self
                .participants
                .send(*recipient, ServerMessage::Signal(message.clone()))
                .await
            {
                delivered += 1;
            }
        }

        debug!(
            room = %room_id,
            peer = %from,
            kind = message.payload.kind(),
            id = %message.id,
            delivered,
            "Relayed signal"
        );
        RelayOutcome::Delivered(delivered)
    }
}
