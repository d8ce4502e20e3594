//! Append-only activity log: one entry per attempted message per run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::token_vault::{format_datetime, parse_datetime};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS activity_log (
    id               TEXT PRIMARY KEY,
    tenant_id        TEXT NOT NULL,
    message_id       TEXT NOT NULL,
    action           TEXT NOT NULL,
    confidence       REAL,
    response_time_ms INTEGER,
    success          INTEGER NOT NULL,
    error_message    TEXT,
    timestamp        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activity_tenant_time
    ON activity_log (tenant_id, timestamp DESC);
";

/// Outcome recorded for one processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    AutoReplied,
    Escalated,
    Skipped,
    Error,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoReplied => "auto_replied",
            Self::Escalated => "escalated",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    fn from_column(raw: &str) -> Self {
        match raw {
            "auto_replied" => Self::AutoReplied,
            "escalated" => Self::Escalated,
            "skipped" => Self::Skipped,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityLogEntry {
    pub id: String,
    pub tenant_id: String,
    pub message_id: String,
    pub action: ActivityAction,
    pub confidence: Option<f64>,
    pub response_time_ms: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Fields the caller supplies when recording an outcome; id and timestamp
/// are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewActivityEntry {
    pub tenant_id: String,
    pub message_id: String,
    pub action: ActivityAction,
    pub confidence: Option<f64>,
    pub response_time_ms: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ActivityStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored timestamp: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

#[derive(Debug, Clone)]
pub struct ActivityStore {
    path: PathBuf,
}

impl ActivityStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn open(&self) -> Result<Connection, ActivityStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Record one outcome, returning the stored entry with its assigned id.
    pub fn append(&self, entry: NewActivityEntry) -> Result<ActivityLogEntry, ActivityStoreError> {
        let conn = self.open()?;
        let stored = ActivityLogEntry {
            id: Uuid::new_v4().to_string(),
            tenant_id: entry.tenant_id,
            message_id: entry.message_id,
            action: entry.action,
            confidence: entry.confidence,
            response_time_ms: entry.response_time_ms,
            success: entry.success,
            error_message: entry.error_message,
            timestamp: Utc::now(),
        };
        conn.execute(
            "INSERT INTO activity_log
               (id, tenant_id, message_id, action, confidence, response_time_ms,
                success, error_message, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                stored.id,
                stored.tenant_id,
                stored.message_id,
                stored.action.as_str(),
                stored.confidence,
                stored.response_time_ms,
                stored.success as i64,
                stored.error_message,
                format_datetime(stored.timestamp),
            ],
        )?;
        Ok(stored)
    }

    /// Most recent entries for a tenant, newest first.
    pub fn list_recent(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<ActivityLogEntry>, ActivityStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, message_id, action, confidence, response_time_ms,
                    success, error_message, timestamp
             FROM activity_log
             WHERE tenant_id = ?1
             ORDER BY timestamp DESC, id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tenant_id, limit], map_activity_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(finish_activity_row(row?)?);
        }
        Ok(entries)
    }

}

type ActivityRow = (
    String,
    String,
    String,
    String,
    Option<f64>,
    Option<i64>,
    i64,
    Option<String>,
    String,
);

fn map_activity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn finish_activity_row(row: ActivityRow) -> Result<ActivityLogEntry, ActivityStoreError> {
    let (id, tenant_id, message_id, action, confidence, response_time_ms, success, error_message, timestamp) =
        row;
    Ok(ActivityLogEntry {
        id,
        tenant_id,
        message_id,
        action: ActivityAction::from_column(&action),
        confidence,
        response_time_ms,
        success: success != 0,
        error_message,
        timestamp: parse_datetime(&timestamp)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ActivityStore) {
        let dir = TempDir::new().unwrap();
        let store = ActivityStore::new(dir.path().join("activity.db"));
        (dir, store)
    }

    fn entry(tenant: &str, message: &str, action: ActivityAction) -> NewActivityEntry {
        NewActivityEntry {
            tenant_id: tenant.to_string(),
            message_id: message.to_string(),
            action,
            confidence: Some(0.9),
            response_time_ms: Some(120),
            success: true,
            error_message: None,
        }
    }

    #[test]
    fn append_then_list_round_trips() {
        let (_dir, store) = store();
        let stored = store
            .append(entry("tenant-a", "m1", ActivityAction::AutoReplied))
            .unwrap();
        assert!(!stored.id.is_empty());

        let entries = store.list_recent("tenant-a", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message_id, "m1");
        assert_eq!(entries[0].action, ActivityAction::AutoReplied);
        assert_eq!(entries[0].confidence, Some(0.9));
        assert!(entries[0].success);
    }

    #[test]
    fn list_is_scoped_to_tenant() {
        let (_dir, store) = store();
        store
            .append(entry("tenant-a", "m1", ActivityAction::Escalated))
            .unwrap();
        store
            .append(entry("tenant-b", "m2", ActivityAction::Skipped))
            .unwrap();

        let entries = store.list_recent("tenant-a", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tenant_id, "tenant-a");
    }

    #[test]
    fn error_entries_keep_their_message() {
        let (_dir, store) = store();
        let mut failed = entry("tenant-a", "m3", ActivityAction::Error);
        failed.success = false;
        failed.error_message = Some("send rejected".to_string());
        store.append(failed).unwrap();

        let entries = store.list_recent("tenant-a", 10).unwrap();
        assert!(!entries[0].success);
        assert_eq!(entries[0].error_message.as_deref(), Some("send rejected"));
    }

    #[test]
    fn serializes_action_as_snake_case() {
        let json = serde_json::to_string(&ActivityAction::AutoReplied).unwrap();
        assert_eq!(json, "\"auto_replied\"");
    }
}
