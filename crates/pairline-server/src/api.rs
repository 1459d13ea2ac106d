use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use pairline_shared::IceConfig;
use pairline_store::{Ban, TrustRecord};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ice-config", get(ice_config))
        .route("/admin/status", get(admin_status))
        .route("/admin/bans", get(admin_list_bans))
        .route("/admin/trust/:address", get(admin_trust))
        .route("/admin/unban", post(admin_unban))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    active_users: usize,
    queue_length: usize,
    rooms: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    active_users: usize,
    rooms: usize,
    bans: usize,
}

#[derive(Deserialize)]
struct UnbanRequest {
    address: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    let hub = &state.hub;
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        active_users: hub.participants.count().await,
        // Stopped queue reads as empty.
        queue_length: hub.queue.len().await.unwrap_or(0),
        rooms: hub.rooms.room_count().await,
    })
}

async fn ice_config(State(state): State<AppState>) -> Json<IceConfig> {
    Json(state.config.ice_config())
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let safety = state.hub.safety.clone();
    let bans = run_blocking(move || safety.list_bans()).await??;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_users: state.hub.participants.count().await,
        rooms: state.hub.rooms.room_count().await,
        bans: bans.len(),
    }))
}

async fn admin_list_bans(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<Ban>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let safety = state.hub.safety.clone();
    let bans = run_blocking(move || safety.list_bans()).await??;
    Ok(Json(bans))
}

async fn admin_trust(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<TrustRecord>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let safety = state.hub.safety.clone();
    let record = run_blocking(move || safety.trust_of(&address)).await??;
    Ok(Json(record))
}

async fn admin_unban(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UnbanRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let address = req.address.trim().to_string();
    if address.is_empty() {
        return Err(ServerError::BadRequest("address must not be empty".into()));
    }

    let safety = state.hub.safety.clone();
    let target = address.clone();
    if !run_blocking(move || safety.unban(&target)).await?? {
        return Err(ServerError::NotFound(format!("no ban for {address}")));
    }

    info!(addr = %address, "Admin lifted ban");
    Ok(Json(serde_json::json!({ "unbanned": true })))
}

/// SQLite calls stay off the async workers.
async fn run_blocking<T, F>(f: F) -> Result<T, ServerError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP + WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
