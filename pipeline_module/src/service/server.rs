use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::task;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use rate_limit_module::{RateLimitPolicy, RateLimiter};

use crate::activity_store::ActivityStore;
use crate::pipeline::BatchRunner;

use super::config::ServiceConfig;
use super::BoxError;

/// Rate-limit bucket for failed trigger authentications.
const TRIGGER_AUTH_ACTION: &str = "batch_trigger";
const TRIGGER_AUTH_IDENTITY: &str = "service";

#[derive(Clone)]
struct AppState {
    config: Arc<ServiceConfig>,
    activity_store: ActivityStore,
    limiter: Arc<RateLimiter>,
}

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);

    let activity_store = ActivityStore::new(&config.activity_db_path);
    let state = AppState {
        config: Arc::new(config),
        activity_store,
        limiter: Arc::new(
            RateLimiter::new().with_policy(TRIGGER_AUTH_ACTION, RateLimitPolicy::sign_in()),
        ),
    };

    info!("mailbox automation service listening on {}", addr);

    let app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/batch/run", post(trigger_batch))
        .route("/activity", get(recent_activity))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

/// Check the shared bearer token, counting failures against the limiter so
/// a guessing caller gets locked out before exhausting the token space.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    match state
        .limiter
        .check_limit(TRIGGER_AUTH_ACTION, TRIGGER_AUTH_IDENTITY)
    {
        Ok(status) if status.is_blocked => {
            let retry_after = status
                .retry_after
                .map(|d| d.num_seconds().max(0))
                .unwrap_or(0);
            return Err((
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "error": "too many failed attempts",
                    "retryAfterSecs": retry_after,
                })),
            ));
        }
        Ok(_) => {}
        Err(err) => warn!("rate limit check failed: {}", err),
    }

    match extract_bearer_token(headers) {
        Some(token) if token == state.config.batch_auth_token => {
            if let Err(err) = state
                .limiter
                .reset(TRIGGER_AUTH_ACTION, TRIGGER_AUTH_IDENTITY)
            {
                warn!("rate limit reset failed: {}", err);
            }
            Ok(())
        }
        _ => {
            warn!("rejected trigger request with missing or bad token");
            if let Err(err) = state
                .limiter
                .record_attempt(TRIGGER_AUTH_ACTION, TRIGGER_AUTH_IDENTITY)
            {
                warn!("rate limit record failed: {}", err);
            }
            Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "unauthorized"})),
            ))
        }
    }
}

/// Extract Bearer token from Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

async fn trigger_batch(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection.into_response();
    }

    let config = state.config.clone();
    let outcome = task::spawn_blocking(move || {
        let runner = BatchRunner::from_config(&config)?;
        runner.run()
    })
    .await;

    match outcome {
        Ok(Ok(batch)) => (StatusCode::OK, Json(batch)).into_response(),
        Ok(Err(err)) => {
            error!("batch run failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "batch run failed"})),
            )
                .into_response()
        }
        Err(err) => {
            error!("batch task panicked: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "batch run failed"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    tenant: String,
    limit: Option<u32>,
}

async fn recent_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ActivityQuery>,
) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection.into_response();
    }

    let store = state.activity_store.clone();
    let limit = query.limit.unwrap_or(50).min(500);
    let tenant = query.tenant;
    let outcome = task::spawn_blocking(move || store.list_recent(&tenant, limit)).await;

    match outcome {
        Ok(Ok(entries)) => (StatusCode::OK, Json(entries)).into_response(),
        Ok(Err(err)) => {
            error!("activity read failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "activity unavailable"})),
            )
                .into_response()
        }
        Err(err) => {
            error!("activity task panicked: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "activity unavailable"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn test_state(dir: &std::path::Path) -> AppState {
        let config = ServiceConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            batch_auth_token: "secret".to_string(),
            oauth_client_id: "client".to_string(),
            oauth_client_secret: "shh".to_string(),
            oauth_token_url: "http://localhost/token".to_string(),
            mailbox_api_base: "http://localhost".to_string(),
            ai_api_url: "http://localhost/v1".to_string(),
            ai_api_key: None,
            ai_model: "test-model".to_string(),
            tenants_db_path: dir.join("tenants.db"),
            tokens_db_path: dir.join("tokens.db"),
            activity_db_path: dir.join("activity.db"),
            notifications_db_path: dir.join("notifications.db"),
            batch_message_limit: 10,
            http_timeout: Duration::from_secs(5),
        };
        AppState {
            activity_store: ActivityStore::new(&config.activity_db_path),
            config: Arc::new(config),
            limiter: Arc::new(
                RateLimiter::new().with_policy(TRIGGER_AUTH_ACTION, RateLimitPolicy::sign_in()),
            ),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn authorize_accepts_configured_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        assert!(authorize(&state, &bearer("secret")).is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_wrong_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let (status, _) = authorize(&state, &HeaderMap::new()).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = authorize(&state, &bearer("wrong")).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn authorize_blocks_after_repeated_failures() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        for _ in 0..5 {
            let (status, _) = authorize(&state, &bearer("wrong")).unwrap_err();
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        // Even the right token is turned away while the block lasts.
        let (status, body) = authorize(&state, &bearer("secret")).unwrap_err();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body.0["retryAfterSecs"].as_i64().unwrap() > 0);
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn rejects_non_bearer_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert_eq!(extract_bearer_token(&headers), None);
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);
    }
}
