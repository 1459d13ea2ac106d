use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{MessageId, ParticipantId, Preferences, RoomId};

/// Messages a client sends over the signaling socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Ask for a partner
    JoinQueue {
        #[serde(default)]
        preferences: Preferences,
    },

    /// Stop waiting for a partner
    LeaveQueue,

    /// Enter a room (after match-found, or a shared group room)
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        display_name: Option<String>,
    },

    LeaveRoom {
        room_id: RoomId,
    },

    /// Negotiation or in-call payload relayed to the other member(s)
    Signal(SignalMessage),

    /// Ends the session immediately and files an automatic report
    Panic {
        room_id: RoomId,
    },

    Report {
        room_id: RoomId,
        reason: String,
        #[serde(default)]
        details: Option<String>,
    },
}

/// Messages the server pushes to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message on every accepted connection
    Welcome { participant_id: ParticipantId },

    /// Enqueued, no partner yet
    Queued,

    MatchFound { room_id: RoomId },

    /// Role for the 1:1 negotiation; only the initiator sends the opening offer
    IsInitiator { is_initiator: bool },

    /// Group rooms: members already present, the joiner offers to each of them
    ExistingPeers { peers: Vec<ParticipantId> },

    PeerJoined { peer_id: ParticipantId },

    PeerLeft { peer_id: ParticipantId },

    /// The 1:1 partner left or was removed
    PeerDisconnected,

    Signal(SignalMessage),

    ActiveUsers { count: usize },

    /// Connection refused or terminated by the safety ledger
    Banned { reason: String },

    Error { message: String },
}

/// A relayed signaling message.
///
/// `sender` is stamped by the server; anything a client puts there is
/// overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    /// Group rooms: deliver to this member only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
    pub payload: SignalPayload,
}

impl SignalMessage {
    pub fn new(room_id: RoomId, target: Option<ParticipantId>, payload: SignalPayload) -> Self {
        Self {
            id: MessageId::new(),
            room_id,
            target,
            sender: None,
            created_at: Utc::now(),
            payload,
        }
    }

    /// Acknowledgment for `self`, addressed back to its sender.
    pub fn ack(&self) -> Self {
        Self::new(
            self.room_id.clone(),
            self.sender,
            SignalPayload::Ack { ack_of: self.id },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalPayload {
    /// SDP offer
    Offer { sdp: String },
    /// SDP answer
    Answer { sdp: String },
    /// Trickled ICE candidate
    IceCandidate(IceCandidate),
    /// Remote camera switched off / on
    ToggleVideo { is_video_off: bool },
    /// Text-mode message
    Chat { text: String },
    /// Receipt for a previously relayed signal
    Ack { ack_of: MessageId },
}

impl SignalPayload {
    /// Acks are never acknowledged themselves.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, SignalPayload::Ack { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate(_) => "ice-candidate",
            SignalPayload::ToggleVideo { .. } => "toggle-video",
            SignalPayload::Chat { .. } => "chat",
            SignalPayload::Ack { .. } => "ack",
        }
    }
}

/// Browser-compatible `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::from)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::from)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::from)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::from)
    }
}
