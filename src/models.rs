use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub user_id: String,
    pub host_account: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredential")
            .field("user_id", &self.user_id)
            .field("host_account", &self.host_account)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// One aggregated reading of the trailing query-history window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub query_count: u64,
    pub total_time: f64,
    pub avg_time: f64,
}

impl MetricSample {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            query_count: 0,
            total_time: 0.0,
            avg_time: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecentSamples {
    pub samples: Vec<MetricSample>,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    pub host_account: Option<String>,
    #[serde(alias = "givenUsername")]
    pub username: Option<String>,
    #[serde(alias = "givenPassword")]
    pub password: Option<String>,
    pub test_only: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub monitoring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub metrics: Vec<MetricSample>,
    pub total: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 2_000,
            backoff: Backoff::Fixed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarehouseBackend {
    Snowflake,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WarehouseSettings {
    pub backend: WarehouseBackend,
    pub host_suffix: String,
    pub application_name: String,
    pub sqlite_path: Option<PathBuf>,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            backend: WarehouseBackend::Snowflake,
            host_suffix: "snowflakecomputing.com".to_string(),
            application_name: "query-pulse".to_string(),
            sqlite_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub bind_addr: String,
    pub cors_origin: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
    pub collection_period_secs: u64,
    pub sweep_period_secs: u64,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub history_capacity: usize,
    pub recent_limit: usize,
    pub connect_retry: RetrySettings,
    pub warehouse: WarehouseSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".to_string(),
            cors_origin: Some("http://localhost:3000".to_string()),
            log_dir: None,
            log_json: false,
            collection_period_secs: 300,
            sweep_period_secs: 300,
            connect_timeout_secs: 30,
            query_timeout_secs: 60,
            close_timeout_secs: 10,
            history_capacity: 288,
            recent_limit: 20,
            connect_retry: RetrySettings::default(),
            warehouse: WarehouseSettings::default(),
        }
    }
}
