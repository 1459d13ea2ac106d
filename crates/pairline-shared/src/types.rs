use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::GROUP_ROOM_PREFIX;

// Participant identity = one live signaling connection. Never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// A fresh 1:1 room id.
    pub fn new_pair() -> Self {
        Self(format!("room-{}", Uuid::new_v4().simple()))
    }

    /// A fresh group room id, carrying the group marker.
    pub fn new_group() -> Self {
        Self(format!("{GROUP_ROOM_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn is_group(&self) -> bool {
        self.0.starts_with(GROUP_ROOM_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier carried by every relayed signal, used for acks and de-duplication.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Video,
    Text,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupSize {
    #[default]
    Pair,
    Group,
}

/// Matching preferences. Advisory only: the queue is strictly FIFO.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub interests: BTreeSet<String>,
    pub mode: ChatMode,
    pub group_size: GroupSize,
}

impl Preferences {
    pub fn video() -> Self {
        Self::default()
    }

    pub fn text() -> Self {
        Self {
            mode: ChatMode::Text,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_group_marker() {
        assert!(RoomId::new_group().is_group());
        assert!(!RoomId::new_pair().is_group());
        assert!(RoomId::from("group-lobby").is_group());
    }

    #[test]
    fn test_preferences_defaults_from_partial_json() {
        let prefs: Preferences = serde_json::from_str(r#"{"mode":"text"}"#).unwrap();
        assert_eq!(prefs.mode, ChatMode::Text);
        assert_eq!(prefs.group_size, GroupSize::Pair);
        assert!(prefs.interests.is_empty());
    }
}
