//! Trust scores, reports and bans.
//!
//! The ledger fails open: with no store, or when the store errors, nobody is
//! banned and every report resolves to the default trust score.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use pairline_shared::constants::{BAN_FLOOR, DEFAULT_TRUST_SCORE, REPORT_PENALTY};
use pairline_store::{Ban, NewReport, ReportOutcome, StoreError, TrustRecord};

use crate::storage::{self, SharedDatabase};

// ---------------------------------------------------------------------------
// Backing stores
// ---------------------------------------------------------------------------

pub trait TrustStore: Send + Sync + 'static {
    fn ban_for(&self, address: &str) -> Result<Option<Ban>, StoreError>;

    /// Current standing of a trust identity; fresh if never reported.
    fn trust_of(&self, identity: &str) -> Result<TrustRecord, StoreError>;

    /// Record the report and charge the penalty atomically.
    fn apply_report(
        &self,
        report: &NewReport,
        penalty: i64,
        ban_floor: i64,
    ) -> Result<ReportOutcome, StoreError>;

    fn unban(&self, address: &str) -> Result<bool, StoreError>;

    fn list_bans(&self) -> Result<Vec<Ban>, StoreError>;
}

pub struct SqliteTrustStore {
    db: SharedDatabase,
}

impl SqliteTrustStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

impl TrustStore for SqliteTrustStore {
    fn ban_for(&self, address: &str) -> Result<Option<Ban>, StoreError> {
        storage::lock(&self.db)?.get_ban(address)
    }

    fn trust_of(&self, identity: &str) -> Result<TrustRecord, StoreError> {
        storage::lock(&self.db)?.get_trust(identity)
    }

    fn apply_report(
        &self,
        report: &NewReport,
        penalty: i64,
        ban_floor: i64,
    ) -> Result<ReportOutcome, StoreError> {
        storage::lock(&self.db)?.apply_report(report, penalty, ban_floor)
    }

    fn unban(&self, address: &str) -> Result<bool, StoreError> {
        storage::lock(&self.db)?.unban_address(address)
    }

    fn list_bans(&self) -> Result<Vec<Ban>, StoreError> {
        storage::lock(&self.db)?.list_bans()
    }
}

#[derive(Default)]
struct MemoryTrust {
    records: HashMap<String, TrustRecord>,
    bans: HashMap<String, Ban>,
}

/// Keeps everything in process memory. State is lost on restart.
#[derive(Default)]
pub struct MemoryTrustStore {
    inner: Mutex<MemoryTrust>,
}

impl MemoryTrustStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryTrust>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("trust lock poisoned".into()))
    }
}

impl TrustStore for MemoryTrustStore {
    fn ban_for(&self, address: &str) -> Result<Option<Ban>, StoreError> {
        Ok(self.lock()?.bans.get(address).cloned())
    }

    fn trust_of(&self, identity: &str) -> Result<TrustRecord, StoreError> {
        Ok(self
            .lock()?
            .records
            .get(identity)
            .cloned()
            .unwrap_or_else(|| TrustRecord::fresh(identity)))
    }

    fn apply_report(
        &self,
        report: &NewReport,
        penalty: i64,
        ban_floor: i64,
    ) -> Result<ReportOutcome, StoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let identity = report.trust_identity();

        let record = state
            .records
            .entry(identity.clone())
            .or_insert_with(|| TrustRecord::fresh(identity));
        record.trust_score = (record.trust_score - penalty).max(0);
        record.updated_at = now;

        let mut new_ban = None;
        if record.trust_score <= ban_floor && !record.banned {
            if let Some(address) = &report.reported_addr {
                let reason = format!("trust score dropped to {}", record.trust_score);
                record.banned = true;
                record.ban_reason = Some(reason.clone());
                new_ban = Some(Ban {
                    address: address.clone(),
                    reason,
                    banned_at: now,
                });
            }
        }

        let trust = record.clone();
        if let Some(ban) = &new_ban {
            state.bans.insert(ban.address.clone(), ban.clone());
        }

        Ok(ReportOutcome {
            report_id: Uuid::new_v4(),
            trust,
            new_ban,
        })
    }

    fn unban(&self, address: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        state.records.remove(address);
        Ok(state.bans.remove(address).is_some())
    }

    fn list_bans(&self) -> Result<Vec<Ban>, StoreError> {
        let mut bans: Vec<Ban> = self.lock()?.bans.values().cloned().collect();
        bans.sort_by(|a, b| b.banned_at.cmp(&a.banned_at));
        Ok(bans)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// What a filed report did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportVerdict {
    pub trust_score: i64,
    pub new_ban: Option<Ban>,
}

#[derive(Clone)]
pub struct SafetyLedger {
    store: Option<Arc<dyn TrustStore>>,
    penalty: i64,
    ban_floor: i64,
}

impl SafetyLedger {
    pub fn new(store: Arc<dyn TrustStore>, penalty: i64, ban_floor: i64) -> Self {
        Self {
            store: Some(store),
            penalty,
            ban_floor,
        }
    }

    /// No store at all: nothing is ever banned.
    pub fn without_store() -> Self {
        warn!("Safety ledger running without a store; bans are disabled");
        Self {
            store: None,
            penalty: REPORT_PENALTY,
            ban_floor: BAN_FLOOR,
        }
    }

    pub fn check_ban(&self, address: &str) -> Option<Ban> {
        let store = self.store.as_ref()?;
        match store.ban_for(address) {
            Ok(ban) => ban,
            Err(e) => {
                warn!(addr = %address, error = %e, "Ban lookup failed, letting the connection through");
                None
            }
        }
    }

    pub fn file_report(&self, report: &NewReport) -> ReportVerdict {
        let degraded = ReportVerdict {
            trust_score: DEFAULT_TRUST_SCORE,
            new_ban: None,
        };

        let Some(store) = &self.store else {
            warn!(reported = %report.reported_id, "No store, report dropped");
            return degraded;
        };

        match store.apply_report(report, self.penalty, self.ban_floor) {
            Ok(outcome) => {
                info!(
                    report = %outcome.report_id,
                    reporter = %report.reporter_id,
                    reported = %report.reported_id,
                    reason = %report.reason,
                    trust = outcome.trust.trust_score,
                    "Report filed"
                );
                if let Some(ban) = &outcome.new_ban {
                    warn!(addr = %ban.address, reason = %ban.reason, "Address banned");
                }
                ReportVerdict {
                    trust_score: outcome.trust.trust_score,
                    new_ban: outcome.new_ban,
                }
            }
            Err(e) => {
                warn!(reported = %report.reported_id, error = %e, "Report could not be stored");
                degraded
            }
        }
    }

    /// Trust standing of an address. Without a store everyone is fresh.
    pub fn trust_of(&self, address: &str) -> Result<TrustRecord, StoreError> {
        match &self.store {
            Some(store) => store.trust_of(address),
            None => Ok(TrustRecord::fresh(address)),
        }
    }

    pub fn unban(&self, address: &str) -> Result<bool, StoreError> {
        match &self.store {
            Some(store) => {
                let removed = store.unban(address)?;
                if removed {
                    info!(addr = %address, "Address unbanned");
                }
                Ok(removed)
            }
            None => Ok(false),
        }
    }

    pub fn list_bans(&self) -> Result<Vec<Ban>, StoreError> {
        match &self.store {
            Some(store) => store.list_bans(),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use pairline_shared::types::ParticipantId;
    use pairline_store::{Database, Location};

    use super::*;

    fn report_against(addr: &str) -> NewReport {
        NewReport {
            reporter_id: ParticipantId::new(),
            reported_id: ParticipantId::new(),
            reason: "abuse".into(),
            details: None,
            reporter_addr: Some("198.51.100.1".into()),
            reported_addr: Some(addr.into()),
        }
    }

    fn sqlite_ledger() -> SafetyLedger {
        let db = Arc::new(StdMutex::new(Database::open_in_memory().unwrap()));
        SafetyLedger::new(Arc::new(SqliteTrustStore::new(db)), REPORT_PENALTY, BAN_FLOOR)
    }

    struct FailingStore;

    impl TrustStore for FailingStore {
        fn ban_for(&self, _: &str) -> Result<Option<Ban>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn trust_of(&self, _: &str) -> Result<TrustRecord, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn apply_report(&self, _: &NewReport, _: i64, _: i64) -> Result<ReportOutcome, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn unban(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn list_bans(&self) -> Result<Vec<Ban>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    fn assert_ban_after_five(ledger: &SafetyLedger) {
        let addr = "1.2.3.4";
        for expected in [90, 80, 70, 60] {
            let verdict = ledger.file_report(&report_against(addr));
            assert_eq!(verdict.trust_score, expected);
            assert!(verdict.new_ban.is_none());
        }
        assert!(ledger.check_ban(addr).is_none());
        assert_eq!(ledger.trust_of(addr).unwrap().trust_score, 60);

        let verdict = ledger.file_report(&report_against(addr));
        assert_eq!(verdict.trust_score, 50);
        assert_eq!(verdict.new_ban.as_ref().map(|b| b.address.as_str()), Some(addr));
        assert!(ledger.check_ban(addr).is_some());
        assert_eq!(ledger.list_bans().unwrap().len(), 1);

        let record = ledger.trust_of(addr).unwrap();
        assert!(record.banned);
        assert_eq!(ledger.trust_of("9.9.9.9").unwrap().trust_score, DEFAULT_TRUST_SCORE);

        // Further reports do not ban twice.
        assert!(ledger.file_report(&report_against(addr)).new_ban.is_none());
    }

    #[test]
    fn test_five_reports_ban_sqlite() {
        assert_ban_after_five(&sqlite_ledger());
    }

    #[test]
    fn test_five_reports_ban_memory() {
        let ledger = SafetyLedger::new(
            Arc::new(MemoryTrustStore::default()),
            REPORT_PENALTY,
            BAN_FLOOR,
        );
        assert_ban_after_five(&ledger);
    }

    #[test]
    fn test_bans_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let location = Location::File(dir.path().join("pairline.db"));
        let open = || {
            let db = storage::open(&location).unwrap();
            SafetyLedger::new(Arc::new(SqliteTrustStore::new(db)), 60, 50)
        };

        let ledger = open();
        assert!(ledger.file_report(&report_against("7.7.7.7")).new_ban.is_some());
        drop(ledger);

        let reopened = open();
        assert_eq!(reopened.check_ban("7.7.7.7").map(|b| b.address), Some("7.7.7.7".into()));
        assert_eq!(reopened.trust_of("7.7.7.7").unwrap().trust_score, 40);
    }

    #[test]
    fn test_unknown_address_never_banned() {
        let ledger = sqlite_ledger();
        let mut report = report_against("1.2.3.4");
        report.reported_addr = None;

        for _ in 0..6 {
            assert!(ledger.file_report(&report).new_ban.is_none());
        }
        assert!(ledger.list_bans().unwrap().is_empty());
    }

    #[test]
    fn test_unban_lifts_ban() {
        let ledger = SafetyLedger::new(Arc::new(MemoryTrustStore::default()), 60, 50);
        let verdict = ledger.file_report(&report_against("5.6.7.8"));
        assert!(verdict.new_ban.is_some());

        assert!(ledger.unban("5.6.7.8").unwrap());
        assert!(ledger.check_ban("5.6.7.8").is_none());
        assert!(!ledger.unban("5.6.7.8").unwrap());
    }

    #[test]
    fn test_fails_open_on_store_errors() {
        let ledger = SafetyLedger::new(Arc::new(FailingStore), REPORT_PENALTY, BAN_FLOOR);
        assert!(ledger.check_ban("1.2.3.4").is_none());

        let verdict = ledger.file_report(&report_against("1.2.3.4"));
        assert_eq!(verdict.trust_score, DEFAULT_TRUST_SCORE);
        assert!(verdict.new_ban.is_none());
        assert!(ledger.list_bans().is_err());
        assert!(ledger.trust_of("1.2.3.4").is_err());
    }

    #[test]
    fn test_without_store() {
        let ledger = SafetyLedger::without_store();
        assert!(ledger.check_ban("1.2.3.4").is_none());
        assert_eq!(
            ledger.file_report(&report_against("1.2.3.4")).trust_score,
            DEFAULT_TRUST_SCORE
        );
        assert_eq!(ledger.list_bans().unwrap(), Vec::new());
    }
}
