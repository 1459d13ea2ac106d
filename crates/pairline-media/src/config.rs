use std::time::Duration;

use pairline_shared::constants::{
    ICE_CANDIDATE_POOL_SIZE, RECONNECT_GRACE_MS, RECONNECT_INITIAL_DELAY_MS,
    RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_DELAY_MS, STATS_INTERVAL_MS, STREAM_WAIT_TIMEOUT_MS,
};
use pairline_shared::ice::{IceConfig, IceServer};

use crate::error::RtcError;
use crate::quality::EncodingBounds;

/// Timers and limits for one peer link.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// How long a dropped link may recover by itself before we intervene
    pub grace_period: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
    /// How long a single reconnection attempt may take to reach Connected
    pub attempt_timeout: Duration,
    pub stream_wait_timeout: Duration,
    pub stats_interval: Duration,
    pub encoding: EncodingBounds,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(RECONNECT_GRACE_MS),
            reconnect_initial_delay: Duration::from_millis(RECONNECT_INITIAL_DELAY_MS),
            reconnect_max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
            reconnect_max_attempts: RECONNECT_MAX_ATTEMPTS,
            attempt_timeout: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
            stream_wait_timeout: Duration::from_millis(STREAM_WAIT_TIMEOUT_MS),
            stats_interval: Duration::from_millis(STATS_INTERVAL_MS),
            encoding: EncodingBounds::default(),
        }
    }
}

/// Peer connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
}

impl RtcConfig {
    /// Check the configuration can connect peers behind symmetric NATs.
    pub fn validate(&self) -> Result<(), RtcError> {
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(RtcError::InvalidConfig(
                "ICE server entry without URLs".into(),
            ));
        }
        if !self.ice_servers.iter().any(IceServer::is_usable_turn) {
            return Err(RtcError::InvalidConfig(
                "at least one TURN server with credentials is required".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            ice_candidate_pool_size: ICE_CANDIDATE_POOL_SIZE,
        }
    }
}

impl From<IceConfig> for RtcConfig {
    fn from(config: IceConfig) -> Self {
        Self {
            ice_servers: config.ice_servers,
            ice_candidate_pool_size: config.ice_candidate_pool_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_only_config_is_rejected() {
        let config = RtcConfig::default();
        assert!(matches!(config.validate(), Err(RtcError::InvalidConfig(_))));
    }

    #[test]
    fn test_turn_config_is_accepted() {
        let mut config = RtcConfig::default();
        config
            .ice_servers
            .push(IceServer::turn("turn:turn.example.net:3478", "pairline", "secret"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_settings_match_link_timers() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.grace_period, Duration::from_secs(2));
        assert_eq!(settings.reconnect_max_attempts, 5);
        assert_eq!(settings.stream_wait_timeout, Duration::from_secs(15));
    }
}
