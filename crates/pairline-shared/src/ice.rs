//! STUN/TURN configuration handed to clients by `GET /ice-config`.

use serde::{Deserialize, Serialize};

use crate::constants::ICE_CANDIDATE_POOL_SIZE;

/// Browser-compatible `RTCIceServer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// A TURN entry with both halves of its credentials filled in.
    pub fn is_usable_turn(&self) -> bool {
        let has_turn_url = self
            .urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"));
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());

        has_turn_url && filled(&self.username) && filled(&self.credential)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "default_pool_size")]
    pub ice_candidate_pool_size: u8,
}

fn default_pool_size() -> u8 {
    ICE_CANDIDATE_POOL_SIZE
}

impl IceConfig {
    pub fn has_turn(&self) -> bool {
        self.ice_servers.iter().any(IceServer::is_usable_turn)
    }
}
