//! Tenant directory, automation settings, and business context.
//!
//! The pipeline consumes this as its source of truth for which mailboxes to
//! scan and how aggressively to auto-reply. Business context is optional;
//! its absence never fails classification.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::token_vault::{format_datetime, parse_datetime};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub automation_enabled: bool,
    /// Minimum classification confidence for an auto-reply.
    pub confidence_threshold: f64,
    /// Tone hint passed to reply generation ("professional", "friendly", ...).
    pub reply_tone: String,
    pub created_at: DateTime<Utc>,
}

/// Tenant business context embedded into the classification prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessContext {
    pub name: String,
    pub industry: Option<String>,
    #[serde(default)]
    pub faq: Vec<FaqEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TenantStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

const TENANTS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tenants (
    tenant_id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    display_name TEXT,
    automation_enabled INTEGER NOT NULL DEFAULT 0,
    confidence_threshold REAL NOT NULL DEFAULT 0.8,
    reply_tone TEXT NOT NULL DEFAULT 'professional',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS business_context (
    tenant_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    industry TEXT,
    faq_json TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);
";

#[derive(Debug, Clone)]
pub struct TenantStore {
    path: PathBuf,
}

impl TenantStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, TenantStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    pub fn upsert_tenant(&self, record: &TenantRecord) -> Result<(), TenantStoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO tenants (tenant_id, email, display_name, automation_enabled,
                                  confidence_threshold, reply_tone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(tenant_id) DO UPDATE SET
                 email = excluded.email,
                 display_name = excluded.display_name,
                 automation_enabled = excluded.automation_enabled,
                 confidence_threshold = excluded.confidence_threshold,
                 reply_tone = excluded.reply_tone",
            params![
                record.tenant_id,
                record.email,
                record.display_name,
                record.automation_enabled as i64,
                record.confidence_threshold,
                record.reply_tone,
                format_datetime(record.created_at),
            ],
        )?;
        Ok(())
    }

    /// Tenants in scope for a batch run.
    pub fn list_automation_enabled(&self) -> Result<Vec<TenantRecord>, TenantStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT tenant_id, email, display_name, automation_enabled,
                    confidence_threshold, reply_tone, created_at
             FROM tenants WHERE automation_enabled = 1 ORDER BY created_at, tenant_id",
        )?;
        let rows = stmt.query_map([], map_tenant_row)?;
        let mut tenants = Vec::new();
        for row in rows {
            tenants.push(finish_tenant_row(row?)?);
        }
        Ok(tenants)
    }

    pub fn set_business_context(
        &self,
        tenant_id: &str,
        context: &BusinessContext,
    ) -> Result<(), TenantStoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO business_context (tenant_id, name, industry, faq_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id) DO UPDATE SET
                 name = excluded.name,
                 industry = excluded.industry,
                 faq_json = excluded.faq_json,
                 updated_at = excluded.updated_at",
            params![
                tenant_id,
                context.name,
                context.industry,
                serde_json::to_string(&context.faq)?,
                format_datetime(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_business_context(
        &self,
        tenant_id: &str,
    ) -> Result<Option<BusinessContext>, TenantStoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT name, industry, faq_json FROM business_context WHERE tenant_id = ?1",
                params![tenant_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((name, industry, faq_json)) => {
                let faq = serde_json::from_str(&faq_json).unwrap_or_else(|err| {
                    warn!("unreadable FAQ entries for {}, ignoring: {}", tenant_id, err);
                    Vec::new()
                });
                Ok(Some(BusinessContext {
                    name,
                    industry,
                    faq,
                }))
            }
            None => Ok(None),
        }
    }

    fn open(&self) -> Result<Connection, TenantStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(TENANTS_SCHEMA)?;
        Ok(conn)
    }
}

type TenantRow = (String, String, Option<String>, i64, f64, String, String);

fn map_tenant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn finish_tenant_row(row: TenantRow) -> Result<TenantRecord, TenantStoreError> {
    let (tenant_id, email, display_name, enabled, threshold, reply_tone, created_at) = row;
    Ok(TenantRecord {
        tenant_id,
        email,
        display_name,
        automation_enabled: enabled != 0,
        confidence_threshold: threshold,
        reply_tone,
        created_at: parse_datetime(&created_at)?,
    })
}
