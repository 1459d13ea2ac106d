//! # pairline-server
//!
//! Signaling and matchmaking server for Pairline.
//!
//! This binary provides:
//! - **Match queue**: FIFO pairing of anonymous participants, run as a
//!   single actor task
//! - **Rooms**: 1:1 rooms with initiator assignment, and small mesh rooms
//! - **Signaling relay** over WebSocket (`/ws`) for offers, answers and ICE
//!   candidates
//! - **Safety ledger**: reports, trust scores and address bans in SQLite
//! - **REST API** (axum) for health, instance info, ICE configuration and
//!   ban administration
//! - **Per-IP rate limiting** with separate budgets for `/ws`, the public
//!   routes and `/admin/*`

mod api;
mod config;
mod error;
mod hub;
mod match_queue;
mod participants;
mod rate_limit;
mod relay;
mod rooms;
mod safety;
mod storage;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::match_queue::{MatchQueue, MatchQueueHandle, MemoryQueueStore, SqliteQueueStore};
use crate::rate_limit::RateLimiter;
use crate::rooms::RoomRegistry;
use crate::safety::{SafetyLedger, SqliteTrustStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pairline_server=debug")),
        )
        .init();

    info!("Starting Pairline server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        http = %config.http_addr,
        database = ?config.database,
        admin_enabled = config.admin_token.is_some(),
        turn = config.turn.is_some(),
        "Loaded configuration"
    );
    if config.turn.is_none() {
        warn!("No TURN relay configured; clients behind symmetric NAT will not connect");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Store failures degrade to in-memory queueing and a fail-open ledger.
    let (queue, safety) = match storage::open(&config.database) {
        Ok(db) => {
            let store = SqliteQueueStore::new(db.clone());
            match store.discard_leftovers() {
                Ok(0) => {}
                Ok(n) => info!(discarded = n, "Dropped queue entries from a previous run"),
                Err(e) => warn!(error = %e, "Could not clear stale queue entries"),
            }
            let queue = MatchQueue::new(store, config.queue_entry_ttl_secs);
            let safety = SafetyLedger::new(
                Arc::new(SqliteTrustStore::new(db)),
                config.report_penalty,
                config.ban_floor,
            );
            (MatchQueueHandle::spawn(queue), safety)
        }
        Err(e) => {
            warn!(error = %e, "Database unavailable, running without persistence");
            let queue = MatchQueue::new(MemoryQueueStore::default(), config.queue_entry_ttl_secs);
            (MatchQueueHandle::spawn(queue), SafetyLedger::without_store())
        }
    };

    let hub = Hub::new(queue, safety, RoomRegistry::new(config.max_group_size));

    let rate_limiter = RateLimiter::new(config.rate_budgets);

    let http_addr = config.http_addr;
    let app_state = AppState {
        hub: hub.clone(),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config),
        started_at: tokio::time::Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Rate limiter cleanup (every 5 minutes, forget addresses idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let purged = rl.purge_stale(600.0).await;
            if purged > 0 {
                let tracked = rl.tracked().await;
                tracing::debug!(purged, tracked, "Purged idle rate limit entries");
            }
        }
    });

    // Expired queue entries (every minute)
    let queue = hub.queue.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if queue.purge_expired().await.is_err() {
                break;
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
