/// Application name
pub const APP_NAME: &str = "Pairline";

/// Room ids starting with this prefix are group (mesh) rooms
pub const GROUP_ROOM_PREFIX: &str = "group-";

/// Default upper bound on members of a group room
pub const DEFAULT_MAX_GROUP_SIZE: usize = 6;

/// Trust score every identity starts with
pub const DEFAULT_TRUST_SCORE: i64 = 100;

/// Points removed from the reported identity per upheld report
pub const REPORT_PENALTY: i64 = 10;

/// Addresses whose trust score drops to or below this value are banned
pub const BAN_FLOOR: i64 = 50;

/// How long a sender waits for an acknowledgment before the signal counts as lost
pub const ACK_TIMEOUT_MS: u64 = 5_000;

/// Number of recently seen message ids kept for duplicate suppression
pub const DEDUP_WINDOW: usize = 1_000;

/// Give up if local media is not ready within this time
pub const STREAM_WAIT_TIMEOUT_MS: u64 = 15_000;

/// Transport statistics sampling interval
pub const STATS_INTERVAL_MS: u64 = 2_000;

/// Reconnection backoff
pub const RECONNECT_INITIAL_DELAY_MS: u64 = 500;
pub const RECONNECT_MAX_DELAY_MS: u64 = 10_000;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Wait this long after a link drops before starting reconnection
pub const RECONNECT_GRACE_MS: u64 = 2_000;

/// Queue entries older than this are treated as expired
pub const QUEUE_ENTRY_TTL_SECS: i64 = 600;

/// Outgoing video bitrate bounds
pub const VIDEO_MIN_BITRATE_BPS: u32 = 150_000;
pub const VIDEO_MAX_BITRATE_BPS: u32 = 2_500_000;

/// ICE candidates gathered ahead of negotiation
pub const ICE_CANDIDATE_POOL_SIZE: u8 = 10;

/// Default HTTP / WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
