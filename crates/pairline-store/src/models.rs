//! Domain model structs persisted by the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pairline_shared::constants::DEFAULT_TRUST_SCORE;
use pairline_shared::types::{ParticipantId, Preferences};

// ---------------------------------------------------------------------------
// Trust
// ---------------------------------------------------------------------------

/// Reputation of one identity.  Participants have no accounts, so the
/// identity is normally the network address they connect from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustRecord {
    pub identity: String,
    /// 0..=100, starts at 100.
    pub trust_score: i64,
    pub banned: bool,
    pub ban_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TrustRecord {
    /// Record for an identity that has never been reported.
    pub fn fresh(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            trust_score: DEFAULT_TRUST_SCORE,
            banned: false,
            ban_reason: None,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ban
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ban {
    pub address: String,
    pub reason: String,
    pub banned_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// A report as submitted, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReport {
    pub reporter_id: ParticipantId,
    pub reported_id: ParticipantId,
    pub reason: String,
    pub details: Option<String>,
    pub reporter_addr: Option<String>,
    pub reported_addr: Option<String>,
}

impl NewReport {
    /// Stable identity the trust penalty is charged to.
    pub fn trust_identity(&self) -> String {
        self.reported_addr
            .clone()
            .unwrap_or_else(|| self.reported_id.to_string())
    }
}

/// Result of applying one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub report_id: Uuid,
    pub trust: TrustRecord,
    /// Set when this report pushed the address over the ban floor.
    pub new_ban: Option<Ban>,
}

// ---------------------------------------------------------------------------
// Queue entry
// ---------------------------------------------------------------------------

/// Backing data for one waiting participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub participant_id: ParticipantId,
    pub preferences: Preferences,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(participant_id: ParticipantId, preferences: Preferences) -> Self {
        Self {
            participant_id,
            preferences,
            enqueued_at: Utc::now(),
        }
    }
}
