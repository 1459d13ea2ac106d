use serde::Serialize;

use pairline_media::{ConnectionState, LinkStats, RemoteTrack};
use pairline_shared::types::{ParticipantId, RoomId};

/// What the session reports to the UI layer.
///
/// `peer` is `None` on 1:1 links, where the partner is implied by the room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    Connected {
        participant_id: ParticipantId,
    },
    Queued,
    MatchFound {
        room_id: RoomId,
    },
    RoleAssigned {
        is_initiator: bool,
    },
    PeerJoined {
        peer_id: ParticipantId,
    },
    PeerLeft {
        peer_id: ParticipantId,
    },
    /// The 1:1 partner is gone; the room has been torn down locally
    PartnerLeft,
    LinkState {
        peer: Option<ParticipantId>,
        state: ConnectionState,
    },
    RemoteTrack {
        peer: Option<ParticipantId>,
        track: RemoteTrack,
    },
    Stats {
        peer: Option<ParticipantId>,
        stats: LinkStats,
    },
    /// The link gave up (negotiation failure or reconnection exhausted)
    LinkFailed {
        peer: Option<ParticipantId>,
        error: String,
    },
    MediaFailed {
        error: String,
    },
    Chat {
        from: Option<ParticipantId>,
        text: String,
    },
    RemoteVideoToggled {
        from: Option<ParticipantId>,
        is_video_off: bool,
    },
    /// A signal was never acknowledged, resends included
    SignalLost {
        kind: String,
    },
    ActiveUsers {
        count: usize,
    },
    Banned {
        reason: String,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_use_wire_casing() {
        let json = serde_json::to_string(&SessionEvent::RemoteVideoToggled {
            from: None,
            is_video_off: true,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"remote-video-toggled","from":null,"isVideoOff":true}"#
        );

        let json = serde_json::to_string(&SessionEvent::LinkState {
            peer: None,
            state: ConnectionState::Reconnecting,
        })
        .unwrap();
        assert!(json.contains(r#""state":"reconnecting""#));
    }
}
