//! Append-only attendance log.
//!
//! Queryable columns are stored alongside the full decision serialized as
//! JSON, so the record round-trips exactly including its liveness evidence.

use chrono::{SecondsFormat, Utc};
use rusqlite::params;

use rollcall_core::{AttendanceDecision, AttendanceStatus, IdentityId};

use crate::store::{SqliteStore, StoreError};

impl SqliteStore {
    /// Persist one decision. Decisions are immutable; inserting the same id
    /// twice is an error.
    pub fn insert_decision(&self, decision: &AttendanceDecision) -> Result<(), StoreError> {
        let record =
            serde_json::to_string(decision).map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO decisions (id, identity, status, rejection, confidence, track_id, decided_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                decision.id.to_string(),
                decision.identity_id.as_ref().map(IdentityId::as_str),
                decision.status.as_str(),
                decision.rejection.map(|r| r.as_str()),
                decision.confidence as f64,
                decision.track_id.map(|t| t as i64),
                sort_key(decision),
                record,
            ],
        )?;
        tracing::debug!(
            decision_id = %decision.id,
            status = decision.status.as_str(),
            "decision logged"
        );
        Ok(())
    }

    /// Most recent decisions first, at most `limit`.
    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<AttendanceDecision>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM decisions ORDER BY decided_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| row.get::<_, String>(0))?;
        let decisions = rows.map(|r| decode_record(&r?)).collect();
        decisions
    }

    /// Every decision recorded for `identity`, oldest first.
    pub fn decisions_for(&self, identity: &IdentityId) -> Result<Vec<AttendanceDecision>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM decisions WHERE identity = ?1 ORDER BY decided_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([identity.as_str()], |row| row.get::<_, String>(0))?;
        let decisions = rows.map(|r| decode_record(&r?)).collect();
        decisions
    }

    pub fn count_decisions(&self, status: Option<AttendanceStatus>) -> Result<u64, StoreError> {
        let count: u64 = match status {
            Some(status) => self.conn.query_row(
                "SELECT COUNT(*) FROM decisions WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get(0))?,
        };
        Ok(count)
    }
}

/// `decided_at` is normalised to UTC with fixed precision so that text
/// ordering matches instant ordering across offset changes.
fn sort_key(decision: &AttendanceDecision) -> String {
    decision
        .timestamp
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_record(json: &str) -> Result<AttendanceDecision, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::InvalidRecord(e.to_string()))
}
