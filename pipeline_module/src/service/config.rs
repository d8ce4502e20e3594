use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use super::BoxError;

pub const DEFAULT_BATCH_MESSAGE_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Shared bearer token callers present to trigger or inspect batches.
    pub batch_auth_token: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub oauth_token_url: String,
    pub mailbox_api_base: String,
    pub ai_api_url: String,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub tenants_db_path: PathBuf,
    pub tokens_db_path: PathBuf,
    pub activity_db_path: PathBuf,
    pub notifications_db_path: PathBuf,
    /// Unread messages pulled per tenant per run.
    pub batch_message_limit: usize,
    pub http_timeout: Duration,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SERVICE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(9004);

        let batch_auth_token = env_var_non_empty("BATCH_AUTH_TOKEN")
            .ok_or_else(|| "BATCH_AUTH_TOKEN is required".to_string())?;
        let oauth_client_id = env_var_non_empty("OAUTH_CLIENT_ID")
            .ok_or_else(|| "OAUTH_CLIENT_ID is required".to_string())?;
        let oauth_client_secret = env_var_non_empty("OAUTH_CLIENT_SECRET")
            .ok_or_else(|| "OAUTH_CLIENT_SECRET is required".to_string())?;

        let oauth_token_url = env_var_non_empty("OAUTH_TOKEN_URL")
            .unwrap_or_else(|| "https://oauth2.googleapis.com/token".to_string());
        let mailbox_api_base = env_var_non_empty("MAILBOX_API_BASE_URL")
            .unwrap_or_else(|| "https://gmail.googleapis.com".to_string());
        let ai_api_url = env_var_non_empty("AI_API_URL")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let ai_api_key = env_var_non_empty("AI_API_KEY");
        let ai_model = env_var_non_empty("AI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        let state_root = match env_var_non_empty("STATE_ROOT") {
            Some(raw) => resolve_path(raw)?,
            None => default_state_root()?,
        };
        let tenants_db_path = state_root.join("tenants.db");
        let tokens_db_path = state_root.join("tokens.db");
        let activity_db_path = state_root.join("activity.db");
        let notifications_db_path = state_root.join("notifications.db");

        let batch_message_limit = env::var("BATCH_MESSAGE_LIMIT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_BATCH_MESSAGE_LIMIT);
        let http_timeout = Duration::from_secs(
            env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(30),
        );

        Ok(Self {
            host,
            port,
            batch_auth_token,
            oauth_client_id,
            oauth_client_secret,
            oauth_token_url,
            mailbox_api_base,
            ai_api_url,
            ai_api_key,
            ai_model,
            tenants_db_path,
            tokens_db_path,
            activity_db_path,
            notifications_db_path,
            batch_message_limit,
            http_timeout,
        })
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_state_root() -> Result<PathBuf, io::Error> {
    let home =
        env::var("HOME").map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home).join(".inboxpilot"))
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}
