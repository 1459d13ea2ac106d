use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Ban, NewReport, ReportOutcome, TrustRecord};

impl Database {
    /// Trust record for `identity`, or a fresh one (score 100) if it was
    /// never reported.
    pub fn get_trust(&self, identity: &str) -> Result<TrustRecord> {
        let record = self
            .conn()
            .query_row(
                "SELECT identity, trust_score, banned, ban_reason, updated_at
                 FROM trust_records WHERE identity = ?1",
                params![identity],
                row_to_trust,
            )
            .optional()?;

        Ok(record.unwrap_or_else(|| TrustRecord::fresh(identity)))
    }

    pub fn get_ban(&self, address: &str) -> Result<Option<Ban>> {
        self.conn()
            .query_row(
                "SELECT address, reason, banned_at FROM bans WHERE address = ?1",
                params![address],
                row_to_ban,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Lift a ban and restore the address's trust score.
    pub fn unban_address(&mut self, address: &str) -> Result<bool> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = tx.execute("DELETE FROM bans WHERE address = ?1", params![address])?;
        tx.execute("DELETE FROM trust_records WHERE identity = ?1", params![address])?;
        tx.commit()?;

        Ok(removed > 0)
    }

    pub fn list_bans(&self) -> Result<Vec<Ban>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT address, reason, banned_at FROM bans ORDER BY banned_at DESC")?;
        let rows = stmt.query_map([], row_to_ban)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Record a report and charge its penalty in one write transaction.
    ///
    /// The read-modify-write of the trust score happens under
    /// `BEGIN IMMEDIATE`, so concurrent reports against the same identity
    /// serialize instead of losing updates.  When the resulting score is at
    /// or below `ban_floor` and the reported address is known, the address
    /// is banned in the same transaction.
    pub fn apply_report(
        &mut self,
        report: &NewReport,
        penalty: i64,
        ban_floor: i64,
    ) -> Result<ReportOutcome> {
        let report_id = Uuid::new_v4();
        let now = Utc::now();
        let identity = report.trust_identity();

        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO reports (id, reporter_id, reported_id, reason, details,
                                  reporter_addr, reported_addr, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                report_id.to_string(),
                report.reporter_id.to_string(),
                report.reported_id.to_string(),
                report.reason,
                report.details,
                report.reporter_addr,
                report.reported_addr,
                now.to_rfc3339(),
            ],
        )?;

        let current = tx
            .query_row(
                "SELECT identity, trust_score, banned, ban_reason, updated_at
                 FROM trust_records WHERE identity = ?1",
                params![identity],
                row_to_trust,
            )
            .optional()?
            .unwrap_or_else(|| TrustRecord::fresh(identity.clone()));

        let mut trust = TrustRecord {
            trust_score: (current.trust_score - penalty).max(0),
            updated_at: now,
            ..current
        };

        let mut new_ban = None;
        if trust.trust_score <= ban_floor && !trust.banned {
            if let Some(address) = &report.reported_addr {
                let reason = format!("trust score dropped to {}", trust.trust_score);
                tx.execute(
                    "INSERT OR IGNORE INTO bans (address, reason, banned_at) VALUES (?1, ?2, ?3)",
                    params![address, reason, now.to_rfc3339()],
                )?;
                trust.banned = true;
                trust.ban_reason = Some(reason.clone());
                new_ban = Some(Ban {
                    address: address.clone(),
                    reason,
                    banned_at: now,
                });
            }
        }

        tx.execute(
            "INSERT INTO trust_records (identity, trust_score, banned, ban_reason, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identity) DO UPDATE SET
                trust_score = excluded.trust_score,
                banned      = excluded.banned,
                ban_reason  = excluded.ban_reason,
                updated_at  = excluded.updated_at",
            params![
                trust.identity,
                trust.trust_score,
                trust.banned as i64,
                trust.ban_reason,
                trust.updated_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;

        Ok(ReportOutcome {
            report_id,
            trust,
            new_ban,
        })
    }
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_trust(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrustRecord> {
    let identity: String = row.get(0)?;
    let trust_score: i64 = row.get(1)?;
    let banned: i64 = row.get(2)?;
    let ban_reason: Option<String> = row.get(3)?;
    let updated_str: String = row.get(4)?;

    Ok(TrustRecord {
        identity,
        trust_score,
        banned: banned != 0,
        ban_reason,
        updated_at: parse_ts(4, &updated_str)?,
    })
}

fn row_to_ban(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ban> {
    let address: String = row.get(0)?;
    let reason: String = row.get(1)?;
    let banned_str: String = row.get(2)?;

    Ok(Ban {
        address,
        reason,
        banned_at: parse_ts(2, &banned_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairline_shared::types::ParticipantId;

    fn report_against(addr: Option<&str>) -> NewReport {
        NewReport {
            reporter_id: ParticipantId::new(),
            reported_id: ParticipantId::new(),
            reason: "harassment".into(),
            details: None,
            reporter_addr: Some("10.0.0.1".into()),
            reported_addr: addr.map(str::to_string),
        }
    }

    #[test]
    fn test_unreported_identity_is_fresh() {
        let db = Database::open_in_memory().unwrap();
        let trust = db.get_trust("1.2.3.4").unwrap();
        assert_eq!(trust.trust_score, 100);
        assert!(!trust.banned);
    }

    #[test]
    fn test_four_reports_do_not_ban() {
        let mut db = Database::open_in_memory().unwrap();
        for _ in 0..4 {
            let outcome = db.apply_report(&report_against(Some("1.2.3.4")), 10, 50).unwrap();
            assert!(outcome.new_ban.is_none());
        }

        assert_eq!(db.get_trust("1.2.3.4").unwrap().trust_score, 60);
        assert!(db.get_ban("1.2.3.4").unwrap().is_none());
        let filed: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM reports WHERE reported_addr = '1.2.3.4'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(filed, 4);
    }

    #[test]
    fn test_fifth_report_bans_address() {
        let mut db = Database::open_in_memory().unwrap();
        let mut last = None;
        for _ in 0..5 {
            last = Some(db.apply_report(&report_against(Some("1.2.3.4")), 10, 50).unwrap());
        }

        let outcome = last.unwrap();
        assert_eq!(outcome.trust.trust_score, 50);
        assert!(outcome.trust.banned);
        assert_eq!(outcome.new_ban.unwrap().address, "1.2.3.4");
        assert!(db.get_ban("1.2.3.4").unwrap().is_some());
    }

    #[test]
    fn test_ban_is_only_reported_once() {
        let mut db = Database::open_in_memory().unwrap();
        for _ in 0..5 {
            db.apply_report(&report_against(Some("1.2.3.4")), 10, 50).unwrap();
        }
        let sixth = db.apply_report(&report_against(Some("1.2.3.4")), 10, 50).unwrap();
        assert!(sixth.new_ban.is_none());
        assert_eq!(sixth.trust.trust_score, 40);
    }

    #[test]
    fn test_score_never_negative() {
        let mut db = Database::open_in_memory().unwrap();
        let outcome = db.apply_report(&report_against(Some("1.2.3.4")), 500, 50).unwrap();
        assert_eq!(outcome.trust.trust_score, 0);
    }

    #[test]
    fn test_no_address_means_no_ban() {
        let mut db = Database::open_in_memory().unwrap();
        let report = report_against(None);
        for _ in 0..6 {
            let outcome = db.apply_report(&report, 10, 50).unwrap();
            assert!(outcome.new_ban.is_none());
        }
        assert_eq!(db.get_trust(&report.reported_id.to_string()).unwrap().trust_score, 40);
    }

    #[test]
    fn test_unban_restores_trust() {
        let mut db = Database::open_in_memory().unwrap();
        for _ in 0..5 {
            db.apply_report(&report_against(Some("1.2.3.4")), 10, 50).unwrap();
        }

        assert!(db.unban_address("1.2.3.4").unwrap());
        assert!(db.get_ban("1.2.3.4").unwrap().is_none());
        assert_eq!(db.get_trust("1.2.3.4").unwrap().trust_score, 100);
        assert!(!db.unban_address("1.2.3.4").unwrap());
    }
}
