//! Per-tenant notification feed. Batch runs write one consolidated record
//! per tenant instead of one per reply.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::token_vault::{format_datetime, parse_datetime};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notifications (
    id         TEXT PRIMARY KEY,
    tenant_id  TEXT NOT NULL,
    title      TEXT NOT NULL,
    body       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notifications_tenant_time
    ON notifications (tenant_id, created_at DESC);
";

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored timestamp: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

#[derive(Debug, Clone)]
pub struct NotificationStore {
    path: PathBuf,
}

impl NotificationStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn open(&self) -> Result<Connection, NotificationStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    pub fn append(
        &self,
        tenant_id: &str,
        title: &str,
        body: &str,
    ) -> Result<NotificationRecord, NotificationStoreError> {
        let conn = self.open()?;
        let record = NotificationRecord {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO notifications (id, tenant_id, title, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.tenant_id,
                record.title,
                record.body,
                format_datetime(record.created_at),
            ],
        )?;
        Ok(record)
    }

    pub fn list_recent(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<NotificationRecord>, NotificationStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, title, body, created_at
             FROM notifications
             WHERE tenant_id = ?1
             ORDER BY created_at DESC, id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tenant_id, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (id, tenant_id, title, body, created_at) = row?;
            records.push(NotificationRecord {
                id,
                tenant_id,
                title,
                body,
                created_at: parse_datetime(&created_at)?,
            });
        }
        Ok(records)
    }
}
