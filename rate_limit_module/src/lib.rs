//! Sliding-window rate limiting for authentication-adjacent actions.
//!
//! Counters are keyed by `(action, identity)` and live in memory, with an
//! optional JSON snapshot so a client can survive restarts. The window slides
//! from the first attempt in the current window, not a calendar boundary;
//! reaching the attempt cap escalates to a timed block.
//!
//! This is UX throttling on the caller's side of the wire. It is not a
//! security boundary and must be paired with a server-side check for any
//! security-sensitive action.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Limits for one action type.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl RateLimitPolicy {
    /// Sign-in attempts: 5 per 15 minutes, 15 minute block.
    pub fn sign_in() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::minutes(15),
            block_duration: Duration::minutes(15),
        }
    }

    /// Password-reset requests: 3 per 15 minutes, 30 minute block.
    pub fn password_reset() -> Self {
        Self {
            max_attempts: 3,
            window: Duration::minutes(15),
            block_duration: Duration::minutes(30),
        }
    }
}

/// Per-identity counter state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitState {
    pub attempts: u32,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub blocked: bool,
    pub block_until: Option<DateTime<Utc>>,
}

/// What a caller is allowed to do right now.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitStatus {
    pub allowed: bool,
    pub remaining: u32,
    pub is_blocked: bool,
    /// Time left on an active block.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state lock poisoned")]
    LockPoisoned,
}

/// Snapshot row for persistence; tuple keys do not serialize as JSON maps.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    action: String,
    identity: String,
    state: RateLimitState,
}

/// Sliding-window counter with block escalation, keyed by `(action, identity)`.
pub struct RateLimiter {
    policies: HashMap<String, RateLimitPolicy>,
    states: Mutex<HashMap<(String, String), RateLimitState>>,
}

impl RateLimiter {
    /// Limiter with the sign-in and password-reset presets registered.
    pub fn new() -> Self {
        let mut policies = HashMap::new();
        policies.insert("sign_in".to_string(), RateLimitPolicy::sign_in());
        policies.insert("password_reset".to_string(), RateLimitPolicy::password_reset());
        Self {
            policies,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Register or replace the policy for an action type.
    pub fn with_policy(mut self, action: &str, policy: RateLimitPolicy) -> Self {
        self.policies.insert(action.to_string(), policy);
        self
    }

    fn policy(&self, action: &str) -> RateLimitPolicy {
        self.policies
            .get(action)
            .cloned()
            .unwrap_or_else(RateLimitPolicy::sign_in)
    }

    /// Report whether an attempt would be allowed. Read-only apart from
    /// clearing an expired block or an expired window.
    pub fn check_limit(&self, action: &str, identity: &str) -> Result<LimitStatus, RateLimitError> {
        self.check_limit_at(action, identity, Utc::now())
    }

    pub fn check_limit_at(
        &self,
        action: &str,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<LimitStatus, RateLimitError> {
        let policy = self.policy(action);
        let mut states = self.states.lock().map_err(|_| RateLimitError::LockPoisoned)?;
        let key = (action.to_string(), identity.to_string());

        let state = match states.get_mut(&key) {
            Some(state) => state,
            None => {
                return Ok(LimitStatus {
                    allowed: true,
                    remaining: policy.max_attempts,
                    is_blocked: false,
                    retry_after: None,
                });
            }
        };

        if state.blocked {
            match state.block_until {
                Some(until) if until > now => {
                    return Ok(LimitStatus {
                        allowed: false,
                        remaining: 0,
                        is_blocked: true,
                        retry_after: Some(until - now),
                    });
                }
                _ => {
                    // Block expired: counter and flag both reset.
                    states.remove(&key);
                    return Ok(LimitStatus {
                        allowed: true,
                        remaining: policy.max_attempts,
                        is_blocked: false,
                        retry_after: None,
                    });
                }
            }
        }

        if now - state.first_attempt >= policy.window {
            // Window expired: counter resets to zero.
            states.remove(&key);
            return Ok(LimitStatus {
                allowed: true,
                remaining: policy.max_attempts,
                is_blocked: false,
                retry_after: None,
            });
        }

        let remaining = policy.max_attempts.saturating_sub(state.attempts);
        Ok(LimitStatus {
            allowed: remaining > 0,
            remaining,
            is_blocked: false,
            retry_after: None,
        })
    }

    /// Record an attempt. Reaching the cap sets the block immediately.
    pub fn record_attempt(
        &self,
        action: &str,
        identity: &str,
    ) -> Result<LimitStatus, RateLimitError> {
        self.record_attempt_at(action, identity, Utc::now())
    }

    pub fn record_attempt_at(
        &self,
        action: &str,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<LimitStatus, RateLimitError> {
        let policy = self.policy(action);
        let mut states = self.states.lock().map_err(|_| RateLimitError::LockPoisoned)?;
        let key = (action.to_string(), identity.to_string());

        // Clear expired windows/blocks before counting this attempt.
        if let Some(state) = states.get(&key) {
            let block_expired =
                state.blocked && state.block_until.map(|until| until <= now).unwrap_or(true);
            let window_expired = !state.blocked && now - state.first_attempt >= policy.window;
            if block_expired || window_expired {
                states.remove(&key);
            } else if state.blocked {
                let until = state.block_until.unwrap_or(now);
                return Ok(LimitStatus {
                    allowed: false,
                    remaining: 0,
                    is_blocked: true,
                    retry_after: Some(until - now),
                });
            }
        }

        let state = states.entry(key).or_insert_with(|| RateLimitState {
            attempts: 0,
            first_attempt: now,
            last_attempt: now,
            blocked: false,
            block_until: None,
        });
        state.attempts += 1;
        state.last_attempt = now;
        if state.attempts >= policy.max_attempts {
            state.blocked = true;
            state.block_until = Some(now + policy.block_duration);
        }

        Ok(LimitStatus {
            allowed: !state.blocked,
            remaining: policy.max_attempts.saturating_sub(state.attempts),
            is_blocked: state.blocked,
            retry_after: state
                .block_until
                .filter(|_| state.blocked)
                .map(|until| until - now),
        })
    }

    /// Drop the counter for one key (e.g. after a successful sign-in).
    pub fn reset(&self, action: &str, identity: &str) -> Result<(), RateLimitError> {
        let mut states = self.states.lock().map_err(|_| RateLimitError::LockPoisoned)?;
        states.remove(&(action.to_string(), identity.to_string()));
        Ok(())
    }

    /// Write all counter state to a JSON snapshot file.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), RateLimitError> {
        let states = self.states.lock().map_err(|_| RateLimitError::LockPoisoned)?;
        let entries: Vec<SnapshotEntry> = states
            .iter()
            .map(|((action, identity), state)| SnapshotEntry {
                action: action.clone(),
                identity: identity.clone(),
                state: state.clone(),
            })
            .collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }

    /// Restore counter state from a JSON snapshot file, replacing any
    /// in-memory state for the keys it contains.
    pub fn load_snapshot(&self, path: &Path) -> Result<(), RateLimitError> {
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(path)?;
        let entries: Vec<SnapshotEntry> = serde_json::from_str(&raw)?;
        let mut states = self.states.lock().map_err(|_| RateLimitError::LockPoisoned)?;
        for entry in entries {
            states.insert((entry.action, entry.identity), entry.state);
        }
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
