//! Per-address request budgets.
//!
//! Each route class has its own budget, so a client hammering `/info` can
//! still open its `/ws` connection, and heavy admin traffic starves neither.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Which budget a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// The WebSocket upgrade at `/ws`.
    Upgrade,
    /// `/admin/*`.
    Admin,
    /// Everything else: health, info, ICE configuration.
    Public,
}

impl RouteClass {
    pub fn of(path: &str) -> Self {
        if path == "/ws" {
            RouteClass::Upgrade
        } else if path == "/admin" || path.starts_with("/admin/") {
            RouteClass::Admin
        } else {
            RouteClass::Public
        }
    }
}

/// Sustained rate plus how many requests may arrive back to back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    pub per_sec: f64,
    pub burst: f64,
}

impl Budget {
    pub const fn new(per_sec: f64, burst: f64) -> Self {
        Self { per_sec, burst }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budgets {
    pub upgrade: Budget,
    pub admin: Budget,
    pub public: Budget,
}

impl Budgets {
    fn for_class(&self, class: RouteClass) -> Budget {
        match class {
            RouteClass::Upgrade => self.upgrade,
            RouteClass::Admin => self.admin,
            RouteClass::Public => self.public,
        }
    }
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            upgrade: Budget::new(2.0, 10.0),
            admin: Budget::new(1.0, 5.0),
            public: Budget::new(10.0, 30.0),
        }
    }
}

/// Tokens left for one address in one class.
#[derive(Debug, Clone)]
struct Allowance {
    tokens: f64,
    touched: Instant,
}

impl Allowance {
    /// Refill for the time since the last request, then spend one token.
    /// On refusal, returns how long until a token is available, if ever.
    fn spend(&mut self, budget: Budget, now: Instant) -> Result<(), Option<f64>> {
        let idle = now.saturating_duration_since(self.touched).as_secs_f64();
        self.tokens = (self.tokens + idle * budget.per_sec).min(budget.burst);
        self.touched = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        Err((budget.per_sec > 0.0).then(|| (1.0 - self.tokens) / budget.per_sec))
    }
}

/// A refused request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttled {
    pub class: RouteClass,
    pub retry_after_secs: Option<u64>,
}

impl IntoResponse for Throttled {
    fn into_response(self) -> Response {
        let mut response = StatusCode::TOO_MANY_REQUESTS.into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    allowances: Arc<Mutex<HashMap<(IpAddr, RouteClass), Allowance>>>,
    budgets: Budgets,
}

impl RateLimiter {
    pub fn new(budgets: Budgets) -> Self {
        Self {
            allowances: Arc::new(Mutex::new(HashMap::new())),
            budgets,
        }
    }

    pub async fn admit(&self, ip: IpAddr, class: RouteClass) -> Result<(), Throttled> {
        let budget = self.budgets.for_class(class);
        let now = Instant::now();

        let mut allowances = self.allowances.lock().await;
        let allowance = allowances.entry((ip, class)).or_insert_with(|| Allowance {
            tokens: budget.burst,
            touched: now,
        });

        allowance.spend(budget, now).map_err(|wait| Throttled {
            class,
            retry_after_secs: wait.map(|secs| secs.ceil().max(1.0) as u64),
        })
    }

    /// Forget addresses idle for `max_idle_secs`. Returns how many entries went.
    pub async fn purge_stale(&self, max_idle_secs: f64) -> usize {
        let now = Instant::now();
        let mut allowances = self.allowances.lock().await;
        let before = allowances.len();
        allowances.retain(|_, allowance| {
            now.saturating_duration_since(allowance.touched).as_secs_f64() < max_idle_secs
        });
        before - allowances.len()
    }

    pub async fn tracked(&self) -> usize {
        self.allowances.lock().await.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Budgets::default())
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(ip) = client_ip(&req) {
        let class = RouteClass::of(req.uri().path());
        if let Err(throttled) = limiter.admit(ip, class).await {
            warn!(ip = %ip, class = ?class, path = %req.uri().path(), "Rate limit exceeded");
            return throttled.into_response();
        }
    }

    next.run(req).await
}

/// Address the request came from: the socket peer, or for requests without
/// one the first `X-Forwarded-For` hop, then `X-Real-IP`.
pub fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let connect = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    peer_ip(connect, req.headers())
}

pub fn peer_ip(connect: Option<SocketAddr>, headers: &HeaderMap) -> Option<IpAddr> {
    connect.map(|addr| addr.ip()).or_else(|| forwarded_ip(headers))
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    value("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(|hop| hop.trim().parse().ok())
        .or_else(|| value("x-real-ip").and_then(|v| v.trim().parse().ok()))
}
