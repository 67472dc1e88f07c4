//! Scan sessions and suspend/resume state

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::AgentSnapshot;
use crate::oob::TokenSnapshot;
use crate::timekeeper::Phase;
use crate::Result;

/// Continuation blob format version understood by this library
pub const CONTINUATION_VERSION: u32 = 1;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Suspended,
    Finalized,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Suspended => write!(f, "suspended"),
            SessionStatus::Finalized => write!(f, "finalized"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "suspended" => Ok(SessionStatus::Suspended),
            "finalized" => Ok(SessionStatus::Finalized),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// A time-budgeted scan against one target, owned by the root agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: String,
    pub target_id: String,
    pub total_budget: Duration,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl ScanSession {
    /// Create a new active session
    pub fn new(target_id: impl Into<String>, total_budget: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_id: target_id.into(),
            total_budget,
            started_at: Utc::now(),
            status: SessionStatus::Active,
            finalized_at: None,
        }
    }

    /// Elapsed wall time at `now`, zero before the session start
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Budget left at `now`, zero once exhausted
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.total_budget.saturating_sub(self.elapsed(now))
    }

    /// Insert session into database
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO sessions
             (id, target_id, total_budget_secs, started_at, status, finalized_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.id,
                self.target_id,
                self.total_budget.as_secs() as i64,
                self.started_at.to_rfc3339(),
                self.status.to_string(),
                self.finalized_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Find session by id
    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, target_id, total_budget_secs, started_at, status, finalized_at
             FROM sessions WHERE id = ?1",
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(4)?;
        let finalized_at_str: Option<String> = row.get(5)?;
        let budget_secs: i64 = row.get(2)?;
        Ok(Self {
            id: row.get(0)?,
            target_id: row.get(1)?,
            total_budget: Duration::from_secs(budget_secs.max(0) as u64),
            started_at: super::models::parse_datetime(row.get(3)?, 3)?,
            status: status_str.parse().map_err(super::models::invalid_text(4))?,
            finalized_at: finalized_at_str
                .map(|s| super::models::parse_datetime(s, 5))
                .transpose()?,
        })
    }
}

/// Resume state written when a scan is cut short.
///
/// Carries everything a fresh run needs to pick the scan back up: the
/// pending agent tree, unresolved correlation tokens, and the working
/// notes the previous run accumulated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationState {
    pub version: u32,
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub phase: Phase,
    pub agents: Vec<AgentSnapshot>,
    pub unresolved_tokens: Vec<TokenSnapshot>,
    pub findings_summary: Vec<String>,
    pub completed_missions: Vec<String>,
    pub pending_missions: Vec<String>,
    pub notes: Vec<String>,
    pub priority_followups: Vec<String>,
}

impl ContinuationState {
    /// Empty snapshot for a session at the current version
    pub fn new(session_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            version: CONTINUATION_VERSION,
            session_id: session_id.into(),
            saved_at: Utc::now(),
            phase,
            agents: Vec::new(),
            unresolved_tokens: Vec::new(),
            findings_summary: Vec::new(),
            completed_missions: Vec::new(),
            pending_missions: Vec::new(),
            notes: Vec::new(),
            priority_followups: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::run_migrations;

    #[test]
    fn test_session_status_roundtrip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Suspended,
            SessionStatus::Finalized,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_session_time_accounting() {
        let session = ScanSession::new("target-1", Duration::from_secs(3600));
        let later = session.started_at + chrono::Duration::seconds(600);

        assert_eq!(session.elapsed(later), Duration::from_secs(600));
        assert_eq!(session.remaining(later), Duration::from_secs(3000));

        let way_later = session.started_at + chrono::Duration::seconds(7200);
        assert_eq!(session.remaining(way_later), Duration::ZERO);

        let before = session.started_at - chrono::Duration::seconds(10);
        assert_eq!(session.elapsed(before), Duration::ZERO);
    }

    #[test]
    fn test_session_persist_roundtrip() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO targets (id, identifier, kind, first_seen_at, last_seen_at)
             VALUES ('t1', 'example.com', 'domain', ?1, ?1)",
            [Utc::now().to_rfc3339()],
        )
        .unwrap();

        let session = ScanSession::new("t1", Duration::from_secs(1800));
        session.insert(&conn).unwrap();

        let loaded = ScanSession::find_by_id(&conn, &session.id).unwrap().unwrap();
        assert_eq!(loaded.target_id, "t1");
        assert_eq!(loaded.total_budget, Duration::from_secs(1800));
        assert_eq!(loaded.status, SessionStatus::Active);
        assert!(loaded.finalized_at.is_none());

        assert!(ScanSession::find_by_id(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_continuation_state_serializes() {
        let state = ContinuationState::new("s1", Phase::Critical);
        let json = serde_json::to_string(&state).unwrap();
        let back: ContinuationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, CONTINUATION_VERSION);
        assert_eq!(back.session_id, "s1");
        assert_eq!(back.phase, Phase::Critical);
    }
}
