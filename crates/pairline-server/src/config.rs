//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::str::FromStr;

use pairline_shared::constants::{
    BAN_FLOOR, DEFAULT_HTTP_PORT, DEFAULT_MAX_GROUP_SIZE, ICE_CANDIDATE_POOL_SIZE,
    QUEUE_ENTRY_TTL_SECS, REPORT_PENALTY,
};
use pairline_shared::{IceConfig, IceServer};
use pairline_store::Location;

use crate::rate_limit::{Budget, Budgets};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite file. `:memory:` keeps everything in memory.
    /// Env: `DATABASE_PATH`
    /// Default: platform data directory.
    pub database: Location,

    /// Env: `INSTANCE_NAME`
    /// Default: `"Pairline Node"`
    pub instance_name: String,

    /// Bearer token for /admin/*.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Trust points removed per report.
    /// Env: `REPORT_PENALTY`
    pub report_penalty: i64,

    /// A trust score at or below this bans the address.
    /// Env: `BAN_FLOOR`
    pub ban_floor: i64,

    /// Env: `QUEUE_ENTRY_TTL_SECS`
    pub queue_entry_ttl_secs: i64,

    /// Env: `MAX_GROUP_SIZE`
    pub max_group_size: usize,

    /// Comma separated.
    /// Env: `STUN_URLS`
    pub stun_urls: Vec<String>,

    /// Env: `TURN_URL`, `TURN_USERNAME`, `TURN_CREDENTIAL`
    pub turn: Option<IceServer>,

    /// Per-address request budgets by route class.
    /// Env: `WS_RATE_PER_SEC`, `WS_BURST` for `/ws` upgrades,
    /// `API_RATE_PER_SEC`, `API_BURST` for the public REST routes,
    /// `ADMIN_RATE_PER_SEC`, `ADMIN_BURST` for `/admin/*`.
    pub rate_budgets: Budgets,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database: Location::DataDir,
            instance_name: "Pairline Node".to_string(),
            admin_token: None,
            report_penalty: REPORT_PENALTY,
            ban_floor: BAN_FLOOR,
            queue_entry_ttl_secs: QUEUE_ENTRY_TTL_SECS,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn: None,
            rate_budgets: Budgets::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            config.http_addr = parse_or_keep("HTTP_ADDR", &addr, config.http_addr);
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database = Location::parse(&path);
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        // -- Safety --

        if let Some(val) = lookup("REPORT_PENALTY") {
            config.report_penalty = parse_or_keep("REPORT_PENALTY", &val, config.report_penalty);
        }

        if let Some(val) = lookup("BAN_FLOOR") {
            config.ban_floor = parse_or_keep("BAN_FLOOR", &val, config.ban_floor);
        }

        // -- Matching --

        if let Some(val) = lookup("QUEUE_ENTRY_TTL_SECS") {
            config.queue_entry_ttl_secs =
                parse_or_keep("QUEUE_ENTRY_TTL_SECS", &val, config.queue_entry_ttl_secs);
        }

        if let Some(val) = lookup("MAX_GROUP_SIZE") {
            let size = parse_or_keep("MAX_GROUP_SIZE", &val, config.max_group_size);
            if size >= 2 {
                config.max_group_size = size;
            } else {
                tracing::warn!(value = %val, "MAX_GROUP_SIZE below 2, using default");
            }
        }

        // -- ICE --

        if let Some(val) = lookup("STUN_URLS") {
            config.stun_urls = val
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(url) = lookup("TURN_URL").filter(|u| !u.is_empty()) {
            let turn = IceServer::turn(
                url,
                lookup("TURN_USERNAME").unwrap_or_default(),
                lookup("TURN_CREDENTIAL").unwrap_or_default(),
            );
            if !turn.is_usable_turn() {
                tracing::warn!("TURN_URL set without usable credentials; clients will refuse it");
            }
            config.turn = Some(turn);
        }

        // -- Rate limiting --

        let budgets = &mut config.rate_budgets;
        budgets.upgrade = budget_from(&lookup, "WS", budgets.upgrade);
        budgets.public = budget_from(&lookup, "API", budgets.public);
        budgets.admin = budget_from(&lookup, "ADMIN", budgets.admin);

        config
    }

    /// STUN/TURN list served at `GET /ice-config`.
    pub fn ice_config(&self) -> IceConfig {
        let mut ice_servers: Vec<IceServer> =
            self.stun_urls.iter().map(|u| IceServer::stun(u.clone())).collect();
        ice_servers.extend(self.turn.clone());

        IceConfig {
            ice_servers,
            ice_candidate_pool_size: ICE_CANDIDATE_POOL_SIZE,
        }
    }
}

/// `<PREFIX>_RATE_PER_SEC` and `<PREFIX>_BURST`. A burst below one would
/// refuse everything, so it keeps the default.
fn budget_from(lookup: &impl Fn(&str) -> Option<String>, prefix: &str, default: Budget) -> Budget {
    let mut budget = default;

    let rate_var = format!("{prefix}_RATE_PER_SEC");
    if let Some(val) = lookup(&rate_var) {
        budget.per_sec = parse_or_keep(&rate_var, &val, budget.per_sec).max(0.0);
    }

    let burst_var = format!("{prefix}_BURST");
    if let Some(val) = lookup(&burst_var) {
        let burst = parse_or_keep(&burst_var, &val, budget.burst);
        if burst >= 1.0 {
            budget.burst = burst;
        } else {
            tracing::warn!(var = %burst_var, value = %val, "Burst below 1, using default");
        }
    }

    budget
}

fn parse_or_keep<T: FromStr + Copy>(name: &str, value: &str, default: T) -> T {
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!(var = name, value = %value, "Invalid value, using default");
            default
        }
    }
}
