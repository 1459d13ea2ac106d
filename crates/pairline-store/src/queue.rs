use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use pairline_shared::types::ParticipantId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::QueueEntry;

impl Database {
    /// Insert or replace the entry for a participant.
    pub fn put_queue_entry(&self, entry: &QueueEntry) -> Result<()> {
        let preferences = serde_json::to_string(&entry.preferences)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO queue_entries (participant_id, preferences, enqueued_at)
             VALUES (?1, ?2, ?3)",
            params![
                entry.participant_id.to_string(),
                preferences,
                sortable_ts(entry.enqueued_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_queue_entry(&self, participant_id: ParticipantId) -> Result<Option<QueueEntry>> {
        let row = self
            .conn()
            .query_row(
                "SELECT participant_id, preferences, enqueued_at
                 FROM queue_entries WHERE participant_id = ?1",
                params![participant_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((id_str, prefs_json, ts_str)) = row else {
            return Ok(None);
        };

        let participant_id = Uuid::parse_str(&id_str)
            .map(ParticipantId)
            .map_err(|e| StoreError::Corrupt(format!("participant id: {e}")))?;
        let preferences = serde_json::from_str(&prefs_json)?;
        let enqueued_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("timestamp: {e}")))?;

        Ok(Some(QueueEntry {
            participant_id,
            preferences,
            enqueued_at,
        }))
    }

    pub fn remove_queue_entry(&self, participant_id: ParticipantId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM queue_entries WHERE participant_id = ?1",
            params![participant_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Delete entries enqueued before `cutoff`.  Returns how many were removed.
    pub fn purge_queue_entries_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM queue_entries WHERE enqueued_at < ?1",
            params![sortable_ts(cutoff)],
        )?;
        Ok(affected)
    }

    /// Participants do not survive a restart, so neither do their entries.
    pub fn clear_queue_entries(&self) -> Result<usize> {
        let affected = self.conn().execute("DELETE FROM queue_entries", [])?;
        Ok(affected)
    }
}

// Fixed-width so that SQL string comparison orders by time.
fn sortable_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
