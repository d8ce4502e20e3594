//! OAuth credential storage and refresh for connected tenants.
//!
//! One row per tenant, mutated in place on every refresh and deleted on
//! disconnect. Freshness is judged against the persisted `expires_at` with a
//! five-minute buffer; there is no in-memory TTL, so calling once per tenant
//! per batch pass always reflects stored state.

use std::fs;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use tracing::{debug, error};

/// Refresh when the stored token expires within this buffer, not only when
/// already expired, so a token never lapses mid-call.
const EXPIRY_BUFFER_SECS: i64 = 5 * 60;

/// A tenant's stored mailbox credential.
#[derive(Debug, Clone)]
pub struct OAuthTokenRecord {
    pub tenant_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scope: Option<String>,
}

/// Connection state for a tenant. Most tenants in a large install are not
/// connected; that is a routine branch, not an error.
#[derive(Debug, Clone)]
pub enum TokenState {
    Connected(OAuthTokenRecord),
    NotConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenVaultError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("http error: {0}")]
    Http(String),
    #[error("token refresh rejected: HTTP {status}: {body}")]
    Refresh { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

const TOKENS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS oauth_tokens (
    tenant_id TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    scope TEXT,
    updated_at TEXT NOT NULL
);
";

/// Owns credential storage and refresh for all tenants.
#[derive(Debug, Clone)]
pub struct TokenVault {
    path: PathBuf,
    token_url: String,
    client_id: String,
    client_secret: String,
    timeout: StdDuration,
}

impl TokenVault {
    pub fn new(
        path: impl Into<PathBuf>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: StdDuration,
    ) -> Result<Self, TokenVaultError> {
        let vault = Self {
            path: path.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            timeout,
        };
        let _ = vault.open()?;
        Ok(vault)
    }

    /// Persist a credential from a consent grant, replacing any prior row.
    pub fn store_grant(&self, record: &OAuthTokenRecord) -> Result<(), TokenVaultError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO oauth_tokens (tenant_id, access_token, refresh_token, expires_at, scope, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(tenant_id) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 expires_at = excluded.expires_at,
                 scope = excluded.scope,
                 updated_at = excluded.updated_at",
            params![
                record.tenant_id,
                record.access_token,
                record.refresh_token,
                format_datetime(record.expires_at),
                record.scope,
                format_datetime(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Remove a tenant's credential (mailbox disconnect).
    pub fn disconnect(&self, tenant_id: &str) -> Result<(), TokenVaultError> {
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM oauth_tokens WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        Ok(())
    }

    /// Read the stored credential without touching the upstream provider.
    pub fn get(&self, tenant_id: &str) -> Result<TokenState, TokenVaultError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT access_token, refresh_token, expires_at, scope
                 FROM oauth_tokens WHERE tenant_id = ?1",
                params![tenant_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((access_token, refresh_token, expires_at, scope)) => {
                Ok(TokenState::Connected(OAuthTokenRecord {
                    tenant_id: tenant_id.to_string(),
                    access_token,
                    refresh_token,
                    expires_at: parse_datetime(&expires_at)?,
                    scope,
                }))
            }
            None => Ok(TokenState::NotConnected),
        }
    }

    /// Return a token that will outlive the expiry buffer, refreshing it
    /// against the provider's token endpoint when necessary. `NotConnected`
    /// is returned as a value; only an upstream rejection is an error.
    pub fn refresh_if_needed(&self, tenant_id: &str) -> Result<TokenState, TokenVaultError> {
        self.refresh_if_needed_at(tenant_id, Utc::now())
    }

    fn refresh_if_needed_at(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenState, TokenVaultError> {
        let record = match self.get(tenant_id)? {
            TokenState::Connected(record) => record,
            TokenState::NotConnected => return Ok(TokenState::NotConnected),
        };

        if record.expires_at - now > Duration::seconds(EXPIRY_BUFFER_SECS) {
            return Ok(TokenState::Connected(record));
        }

        debug!("refreshing mailbox token for tenant {}", tenant_id);
        let refreshed = self.refresh(&record, now)?;
        Ok(TokenState::Connected(refreshed))
    }

    fn refresh(
        &self,
        record: &OAuthTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<OAuthTokenRecord, TokenVaultError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| TokenVaultError::Http(err.to_string()))?;
        let response = client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", record.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .map_err(|err| TokenVaultError::Http(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            error!(
                "token refresh failed for tenant {}: HTTP {} - {}",
                record.tenant_id, status, body
            );
            return Err(TokenVaultError::Refresh { status, body });
        }

        let parsed: RefreshResponse = response
            .json()
            .map_err(|err| TokenVaultError::Http(err.to_string()))?;

        // A refresh response without a new refresh token retains the prior
        // one; overwriting it with an empty value would orphan the tenant.
        let refresh_token = parsed
            .refresh_token
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| record.refresh_token.clone());

        let refreshed = OAuthTokenRecord {
            tenant_id: record.tenant_id.clone(),
            access_token: parsed.access_token,
            refresh_token,
            expires_at: now + Duration::seconds(parsed.expires_in.max(0)),
            scope: parsed.scope.or_else(|| record.scope.clone()),
        };
        self.store_grant(&refreshed)?;
        debug!("mailbox token refreshed for tenant {}", record.tenant_id);
        Ok(refreshed)
    }

    fn open(&self) -> Result<Connection, TokenVaultError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(TOKENS_SCHEMA)?;
        Ok(conn)
    }
}

pub(crate) fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use tempfile::TempDir;

    fn vault_with(server_url: &str, temp: &TempDir) -> TokenVault {
        TokenVault::new(
            temp.path().join("tokens.db"),
            format!("{}/token", server_url),
            "client-id",
            "client-secret",
            StdDuration::from_secs(5),
        )
        .expect("vault")
    }

    fn stored_record(expires_at: DateTime<Utc>) -> OAuthTokenRecord {
        OAuthTokenRecord {
            tenant_id: "tenant-1".to_string(),
            access_token: "old-access".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at,
            scope: Some("mail.modify".to_string()),
        }
    }

    #[test]
    fn missing_tenant_is_not_connected() {
        let temp = TempDir::new().expect("tempdir");
        let vault = vault_with("http://unused.invalid", &temp);
        match vault.refresh_if_needed("nobody").expect("state") {
            TokenState::NotConnected => {}
            TokenState::Connected(_) => panic!("expected NotConnected"),
        }
    }

    #[test]
    fn token_expiring_within_buffer_is_refreshed() {
        let temp = TempDir::new().expect("tempdir");
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-access","expires_in":3600,"token_type":"Bearer"}"#)
            .expect(1)
            .create();

        let vault = vault_with(&server.url(), &temp);
        let now = Utc::now();
        vault
            .store_grant(&stored_record(now + Duration::minutes(3)))
            .expect("store");

        let state = vault.refresh_if_needed_at("tenant-1", now).expect("refresh");
        let record = match state {
            TokenState::Connected(record) => record,
            TokenState::NotConnected => panic!("expected Connected"),
        };
        assert_eq!(record.access_token, "new-access");
        // Response had no refresh_token, so the prior one is retained.
        assert_eq!(record.refresh_token, "refresh-1");
        assert!(record.expires_at > now + Duration::minutes(55));
        mock.assert();
    }

    #[test]
    fn token_with_headroom_is_not_refreshed() {
        let temp = TempDir::new().expect("tempdir");
        let mut server = Server::new();
        let mock = server.mock("POST", "/token").expect(0).create();

        let vault = vault_with(&server.url(), &temp);
        let now = Utc::now();
        vault
            .store_grant(&stored_record(now + Duration::minutes(10)))
            .expect("store");

        let state = vault.refresh_if_needed_at("tenant-1", now).expect("state");
        let record = match state {
            TokenState::Connected(record) => record,
            TokenState::NotConnected => panic!("expected Connected"),
        };
        assert_eq!(record.access_token, "old-access");
        mock.assert();
    }

    #[test]
    fn new_refresh_token_replaces_the_old_one() {
        let temp = TempDir::new().expect("tempdir");
        let mut server = Server::new();
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"new-access","expires_in":3600,"refresh_token":"refresh-2"}"#,
            )
            .create();

        let vault = vault_with(&server.url(), &temp);
        let now = Utc::now();
        vault
            .store_grant(&stored_record(now - Duration::minutes(1)))
            .expect("store");

        vault.refresh_if_needed_at("tenant-1", now).expect("refresh");
        match vault.get("tenant-1").expect("get") {
            TokenState::Connected(record) => assert_eq!(record.refresh_token, "refresh-2"),
            TokenState::NotConnected => panic!("expected Connected"),
        }
    }

    #[test]
    fn rejected_refresh_is_an_error() {
        let temp = TempDir::new().expect("tempdir");
        let mut server = Server::new();
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create();

        let vault = vault_with(&server.url(), &temp);
        let now = Utc::now();
        vault
            .store_grant(&stored_record(now - Duration::minutes(1)))
            .expect("store");

        let err = vault
            .refresh_if_needed_at("tenant-1", now)
            .expect_err("rejected");
        match err {
            TokenVaultError::Refresh { status, .. } => assert_eq!(status, 400),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn disconnect_removes_the_credential() {
        let temp = TempDir::new().expect("tempdir");
        let vault = vault_with("http://unused.invalid", &temp);
        vault
            .store_grant(&stored_record(Utc::now() + Duration::hours(1)))
            .expect("store");
        vault.disconnect("tenant-1").expect("disconnect");
        match vault.get("tenant-1").expect("get") {
            TokenState::NotConnected => {}
            TokenState::Connected(_) => panic!("credential should be gone"),
        }
    }
}
