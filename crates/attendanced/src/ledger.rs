//! Local attendance ledger.
//!
//! One row per completed submission, kept in SQLite next to the daemon.
//! Writes happen on the connection's background thread so request handlers
//! never block on disk.

use attendance_core::OutcomeKind;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id          TEXT PRIMARY KEY,
    user_email  TEXT,
    user_name   TEXT,
    unique_id   TEXT NOT NULL,
    status      TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_created_at ON attendance(created_at);
";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("cannot create ledger directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity fields that may accompany a submission.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_email: Option<String>,
    pub user_name: Option<String>,
}

impl Identity {
    /// Roll-number style id: first word of the name, else the email's local
    /// part, lowercased.
    pub fn unique_id(&self) -> String {
        let from_name = self
            .user_name
            .as_deref()
            .and_then(|n| n.split_whitespace().next());
        let from_email = self
            .user_email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|local| !local.is_empty());
        from_name
            .or(from_email)
            .map(str::to_lowercase)
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    pub unique_id: String,
    pub status: String,
    pub outcome: String,
    pub created_at: String,
}

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `path`.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Append one record for a finished recognition run.
    pub async fn record(
        &self,
        identity: &Identity,
        outcome: OutcomeKind,
    ) -> Result<AttendanceRecord, LedgerError> {
        let record = AttendanceRecord {
            id: Uuid::new_v4().to_string(),
            user_email: identity.user_email.clone(),
            user_name: identity.user_name.clone(),
            unique_id: identity.unique_id(),
            status: if outcome.is_success() { "present" } else { "absent" }.to_string(),
            outcome: outcome.code().to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let row = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (id, user_email, user_name, unique_id, status, outcome, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        row.id,
                        row.user_email,
                        row.user_name,
                        row.unique_id,
                        row.status,
                        row.outcome,
                        row.created_at,
                    ],
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(id = %record.id, unique_id = %record.unique_id, status = %record.status, "attendance recorded");
        Ok(record)
    }

    /// Most recent records first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_email, user_name, unique_id, status, outcome, created_at
                     FROM attendance ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok(AttendanceRecord {
                            id: row.get(0)?,
                            user_email: row.get(1)?,
                            user_name: row.get(2)?,
                            unique_id: row.get(3)?,
                            status: row.get(4)?,
                            outcome: row.get(5)?,
                            created_at: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_sources() {
        let id = Identity {
            user_email: Some("cs23i1010@iiitdm.ac.in".into()),
            user_name: Some("CS23I1010 Jane Doe".into()),
        };
        assert_eq!(id.unique_id(), "cs23i1010");

        let id = Identity {
            user_email: Some("Jane.Doe@iiitdm.ac.in".into()),
            user_name: Some("   ".into()),
        };
        assert_eq!(id.unique_id(), "jane.doe");

        assert_eq!(Identity::default().unique_id(), "unknown");
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let who = Identity {
            user_email: Some("a@x.edu".into()),
            user_name: None,
        };

        let first = ledger.record(&who, OutcomeKind::NoFace).await.unwrap();
        let second = ledger.record(&who, OutcomeKind::Success).await.unwrap();
        assert_eq!(first.status, "absent");
        assert_eq!(first.outcome, "no_face");
        assert_eq!(second.status, "present");

        let rows = ledger.recent(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], second);
        assert_eq!(rows[1], first);

        assert_eq!(ledger.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/attendance.db");
        let ledger = Ledger::open(&path).await.unwrap();
        ledger.record(&Identity::default(), OutcomeKind::Timeout).await.unwrap();
        assert!(path.exists());
    }
}
