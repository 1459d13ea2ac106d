//! REST calls against a Pairline server.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use pairline_media::{RtcConfig, RtcPeerFactory};
use pairline_shared::IceConfig;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub active_users: usize,
    pub queue_length: usize,
    pub rooms: usize,
}

pub async fn fetch_server_info(server_url: &str) -> Result<ServerInfo, ClientError> {
    get_json(&endpoint(server_url, "info")).await
}

/// STUN/TURN servers to hand to the peer connection backend.
pub async fn fetch_ice_config(server_url: &str) -> Result<RtcConfig, ClientError> {
    let config: IceConfig = get_json(&endpoint(server_url, "ice-config")).await?;
    if !config.has_turn() {
        warn!(server = server_url, "Server offers no usable TURN relay");
    }
    Ok(config.into())
}

/// Fetch the ICE configuration and build the WebRTC backend from it.
pub async fn rtc_factory(server_url: &str) -> Result<RtcPeerFactory, ClientError> {
    let config = fetch_ice_config(server_url).await?;
    Ok(RtcPeerFactory::new(config)?)
}

async fn get_json<T: DeserializeOwned>(url: &str) -> Result<T, ClientError> {
    debug!(url, "GET");
    let resp = reqwest::get(url).await?;

    if !resp.status().is_success() {
        return Err(ClientError::Status(resp.status().as_u16()));
    }

    Ok(resp.json().await?)
}

fn endpoint(server_url: &str, path: &str) -> String {
    format!("{}/{}", server_url.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("https://pairline.example/", "ice-config"),
            "https://pairline.example/ice-config"
        );
        assert_eq!(endpoint("http://127.0.0.1:8080", "info"), "http://127.0.0.1:8080/info");
    }

    #[test]
    fn test_server_info_reads_info_response() {
        let info: ServerInfo = serde_json::from_str(
            r#"{"name":"Pairline Node","version":"0.1.0","activeUsers":3,"queueLength":1,"rooms":1}"#,
        )
        .unwrap();
        assert_eq!(info.active_users, 3);
        assert_eq!(info.queue_length, 1);
    }

    #[test]
    fn test_ice_config_converts_to_rtc_config() {
        let config: IceConfig = serde_json::from_str(
            r#"{"iceServers":[{"urls":["stun:stun.l.google.com:19302"]},
                {"urls":["turn:turn.example.net:3478"],"username":"u","credential":"c"}]}"#,
        )
        .unwrap();
        let rtc: RtcConfig = config.into();
        assert_eq!(rtc.ice_servers.len(), 2);
        assert_eq!(rtc.ice_candidate_pool_size, 10);
        assert!(rtc.validate().is_ok());
    }
}
