//! v001 -- Initial schema creation.
//!
//! Creates the safety tables (`trust_records`, `bans`, `reports`) and the
//! `queue_entries` table backing the match queue.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Trust records (keyed by stable identity, usually the address)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS trust_records (
    identity    TEXT PRIMARY KEY NOT NULL,
    trust_score INTEGER NOT NULL DEFAULT 100,
    banned      INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    ban_reason  TEXT,
    updated_at  TEXT NOT NULL                 -- RFC-3339
);

-- ----------------------------------------------------------------
-- Bans (keyed by network address)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS bans (
    address    TEXT PRIMARY KEY NOT NULL,
    reason     TEXT NOT NULL,
    banned_at  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Reports
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reports (
    id             TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    reporter_id    TEXT NOT NULL,
    reported_id    TEXT NOT NULL,
    reason         TEXT NOT NULL,
    details        TEXT,
    reporter_addr  TEXT,
    reported_addr  TEXT,
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reports_reported_addr ON reports(reported_addr);

-- ----------------------------------------------------------------
-- Match queue entry data (order is owned by the queue actor)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS queue_entries (
    participant_id TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    preferences    TEXT NOT NULL,              -- JSON
    enqueued_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_entries_enqueued_at ON queue_entries(enqueued_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
