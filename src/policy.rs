use crate::errors::{AppError, AppResult};
use crate::models::{Backoff, ConnectPayload, RetrySettings, UserCredential};
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use tokio::time::Duration;

const MAX_ATTEMPTS_ALLOWED: u32 = 10;
const MIN_RETRY_DELAY_MS: u64 = 100;
const MAX_RETRY_DELAY_MS: u64 = 600_000;
const MAX_FIELD_LENGTH: usize = 256;

static ACCOUNT_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid account regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub credential: UserCredential,
    pub test_only: bool,
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    host_suffix: String,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new("snowflakecomputing.com")
    }
}

impl PolicyEngine {
    pub fn new(host_suffix: &str) -> Self {
        Self {
            host_suffix: host_suffix.trim_start_matches('.').to_ascii_lowercase(),
        }
    }

    /// Checks a connect form submission and turns it into a credential for `user_id`.
    pub fn validate_connect(&self, user_id: &str, payload: ConnectPayload) -> AppResult<ConnectRequest> {
        let (Some(host_account), Some(username), Some(password)) =
            (payload.host_account, payload.username, payload.password)
        else {
            return Err(AppError::Validation("All fields required.".to_string()));
        };

        let host_account = self.normalize_account(&host_account);
        let username = username.trim().to_string();
        if host_account.is_empty() || username.is_empty() || password.is_empty() {
            return Err(AppError::Validation("All fields required.".to_string()));
        }
        if host_account.len() > MAX_FIELD_LENGTH || username.len() > MAX_FIELD_LENGTH || password.len() > MAX_FIELD_LENGTH {
            return Err(AppError::Validation(format!(
                "Fields must be at most {} characters.",
                MAX_FIELD_LENGTH
            )));
        }
        if !ACCOUNT_IDENTIFIER.is_match(&host_account) {
            return Err(AppError::Validation(format!(
                "Account identifier '{}' contains unsupported characters.",
                host_account
            )));
        }

        Ok(ConnectRequest {
            credential: UserCredential {
                user_id: user_id.to_string(),
                host_account,
                username,
                password,
            },
            test_only: payload.test_only.unwrap_or(false),
        })
    }

    /// Accepts `xy12345`, `xy12345.snowflakecomputing.com` or a pasted URL.
    fn normalize_account(&self, raw: &str) -> String {
        let mut value = raw.trim().to_ascii_lowercase();
        for scheme in ["https://", "http://"] {
            if let Some(stripped) = value.strip_prefix(scheme) {
                value = stripped.to_string();
            }
        }
        let value = value.trim_end_matches('/');
        let suffix = format!(".{}", self.host_suffix);
        value.strip_suffix(suffix.as_str()).unwrap_or(value).to_string()
    }
}

/// Retry schedule for the interactive connect path. Background collection never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.clamp(1, MAX_ATTEMPTS_ALLOWED),
            delay: Duration::from_millis(settings.delay_ms.clamp(MIN_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS)),
            backoff: settings.backoff,
        }
    }

    /// Delay before attempt number `attempt + 1`, with `attempt` starting at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let multiplier = 1u32 << attempt.saturating_sub(1).min(16);
                self.delay
                    .saturating_mul(multiplier)
                    .min(Duration::from_millis(MAX_RETRY_DELAY_MS))
            }
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> AppResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.max_attempts || !is_retryable(&error) => return Err(error),
                Err(error) => {
                    let delay = self.delay_after(attempt);
                    tracing::info!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn is_retryable(error: &AppError) -> bool {
    matches!(
        error,
        AppError::Connection { .. } | AppError::Timeout(_) | AppError::Io(_)
    )
}
