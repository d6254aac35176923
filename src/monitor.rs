use crate::collector::{close_session, Collector, CollectorTimeouts};
use crate::credentials::{CredentialStore, InMemoryCredentialStore};
use crate::errors::{AppError, AppResult};
use crate::history::{HistoryStore, InMemoryHistoryStore};
use crate::models::{
    AckResponse, AppSettings, ConnectPayload, MetricsResponse, StatusResponse, UserCredential,
};
use crate::policy::{PolicyEngine, RetryPolicy};
use crate::redaction::Redactor;
use crate::scheduler::{collector_executor, Scheduler};
use crate::warehouse::Warehouse;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Everything the HTTP layer needs: connection setup, status, history reads and teardown.
pub struct MonitorCore {
    policy: PolicyEngine,
    retry: RetryPolicy,
    credentials: Arc<dyn CredentialStore>,
    history: Arc<dyn HistoryStore>,
    collector: Arc<Collector>,
    scheduler: Scheduler,
    recent_limit: usize,
    history_capacity: usize,
}

impl MonitorCore {
    pub fn new(settings: &AppSettings, warehouse: Arc<dyn Warehouse>) -> Arc<Self> {
        let history = Arc::new(InMemoryHistoryStore::new(settings.history_capacity));
        let history_capacity = history.capacity();
        Self::with_stores(
            settings,
            warehouse,
            Arc::new(InMemoryCredentialStore::new()),
            history,
            history_capacity,
        )
    }

    pub fn with_stores(
        settings: &AppSettings,
        warehouse: Arc<dyn Warehouse>,
        credentials: Arc<dyn CredentialStore>,
        history: Arc<dyn HistoryStore>,
        history_capacity: usize,
    ) -> Arc<Self> {
        let collector = Arc::new(Collector::new(
            credentials.clone(),
            history.clone(),
            warehouse,
            CollectorTimeouts::from_settings(settings),
        ));
        let scheduler = Scheduler::new(
            credentials.clone(),
            collector_executor(collector.clone()),
            Duration::from_secs(settings.collection_period_secs),
            Duration::from_secs(settings.sweep_period_secs),
        );

        Arc::new(Self {
            policy: PolicyEngine::new(&settings.warehouse.host_suffix),
            retry: RetryPolicy::from_settings(&settings.connect_retry),
            credentials,
            history,
            collector,
            scheduler,
            recent_limit: settings.recent_limit.max(1),
            history_capacity: history_capacity.max(1),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Validates the form, proves the credential works, then stores it and starts collection
    /// unless `testOnly` is set. A credential that fails the test is never stored.
    pub async fn connect(&self, user_id: &str, payload: ConnectPayload) -> AppResult<AckResponse> {
        let request = self.policy.validate_connect(user_id, payload)?;
        let credential = &request.credential;

        let session_id = self
            .retry
            .run("warehouse connect", move |attempt| async move {
                self.test_connection(credential, attempt).await
            })
            .await
            .map_err(|error| connect_failure(error, credential))?;

        if request.test_only {
            tracing::info!(user_id = %user_id, account = %credential.host_account, "connection test succeeded");
            return Ok(AckResponse {
                success: true,
                message: format!("Snowflake connection test succeeded. Connection ID: {}", session_id),
            });
        }

        self.credentials.save(request.credential.clone())?;
        if self.scheduler.register_user(user_id, None).await.is_none() {
            tracing::info!(user_id = %user_id, "disconnected while connecting; collection not started");
        }
        tracing::info!(user_id = %user_id, account = %credential.host_account, "warehouse connected");

        Ok(AckResponse {
            success: true,
            message: format!("Snowflake connected. Connection ID: {}", session_id),
        })
    }

    async fn test_connection(&self, credential: &UserCredential, attempt: u32) -> AppResult<String> {
        let timeouts = self.collector.timeouts();
        let session = timeout(timeouts.connect, self.collector.warehouse().connect(credential))
            .await
            .map_err(|_| {
                AppError::Timeout(format!(
                    "warehouse connect did not complete within {}s",
                    timeouts.connect.as_secs()
                ))
            })??;

        let session_id = session.id();
        tracing::debug!(user_id = %credential.user_id, attempt, session_id = %session_id, "test connection opened");
        close_session(session, timeouts.close, credential.user_id.clone()).await;
        Ok(session_id)
    }

    pub async fn status(&self, user_id: &str) -> AppResult<StatusResponse> {
        let job = self.scheduler.job(user_id).await;
        let response = match self.credentials.get(user_id)? {
            Some(credential) => StatusResponse {
                connected: true,
                account: Some(credential.host_account),
                username: Some(credential.username),
                monitoring: job.is_some(),
                period_ms: job.map(|job| job.period_ms),
            },
            None => StatusResponse {
                connected: false,
                account: None,
                username: None,
                monitoring: job.is_some(),
                period_ms: job.map(|job| job.period_ms),
            },
        };
        Ok(response)
    }

    /// Forgets the credential and cancels the user's timer. Safe to repeat.
    pub async fn disconnect(&self, user_id: &str) -> AppResult<AckResponse> {
        let removed = self.credentials.delete(user_id)?;
        let cancelled = self.scheduler.unregister_user(user_id).await;
        tracing::info!(user_id = %user_id, removed, cancelled, "warehouse disconnected");

        Ok(AckResponse {
            success: true,
            message: "Snowflake disconnected successfully.".to_string(),
        })
    }

    pub fn metrics(&self, user_id: &str, limit: Option<usize>) -> AppResult<MetricsResponse> {
        let limit = limit.unwrap_or(self.recent_limit).min(self.history_capacity);
        let recent = self.history.read_recent(user_id, limit)?;
        Ok(MetricsResponse {
            metrics: recent.samples,
            total: recent.total,
        })
    }

    pub async fn start_background_monitoring(&self) -> bool {
        self.scheduler.start_background_monitoring().await
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

fn connect_failure(error: AppError, credential: &UserCredential) -> AppError {
    let redactor = Redactor::new(true).with_secret(&credential.password);
    match error {
        AppError::Validation(_) | AppError::Unauthorized(_) => error,
        AppError::Connection { message, details } => AppError::Connection {
            message,
            details: details.map(|details| redactor.redact(&details).content),
        },
        other => AppError::connection(
            "Failed to connect to Snowflake.",
            redactor.redact(&other.to_string()).content,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::MonitorCore;
    use crate::collector::testing::FakeWarehouse;
    use crate::errors::AppError;
    use crate::models::{AppSettings, ConnectPayload, RetrySettings};
    use std::sync::Arc;
    use tokio::time::Duration;

    fn settings() -> AppSettings {
        AppSettings {
            connect_retry: RetrySettings {
                max_attempts: 3,
                delay_ms: 500,
                ..RetrySettings::default()
            },
            ..AppSettings::default()
        }
    }

    fn payload(test_only: bool) -> ConnectPayload {
        ConnectPayload {
            host_account: Some("XY12345.snowflakecomputing.com".to_string()),
            username: Some("analyst".to_string()),
            password: Some("correct-horse".to_string()),
            test_only: Some(test_only),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_stores_credential_and_starts_collection() {
        let warehouse = Arc::new(FakeWarehouse::default());
        let core = MonitorCore::new(&settings(), warehouse.clone());

        let ack = core.connect("u1", payload(false)).await.expect("connect");
        assert!(ack.success);
        assert!(ack.message.contains("fake-session"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = core.status("u1").await.expect("status");
        assert!(status.connected);
        assert!(status.monitoring);
        assert_eq!(status.account.as_deref(), Some("xy12345"));
        assert_eq!(status.period_ms, Some(300_000));

        let metrics = core.metrics("u1", None).expect("metrics");
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.metrics[0].query_count, 7);
        assert_eq!(warehouse.close_count(), 2);

        core.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_connect_stores_nothing() {
        let core = MonitorCore::new(&settings(), Arc::new(FakeWarehouse::default()));
        let ack = core.connect("u1", payload(true)).await.expect("test connect");
        assert!(ack.message.contains("test succeeded"));

        let status = core.status("u1").await.expect("status");
        assert!(!status.connected);
        assert!(!status.monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_connect_failures_are_retried() {
        let warehouse = Arc::new(FakeWarehouse {
            failing_connects: 2,
            ..FakeWarehouse::default()
        });
        let core = MonitorCore::new(&settings(), warehouse.clone());

        core.connect("u1", payload(true)).await.expect("third attempt succeeds");
        assert_eq!(warehouse.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_surfaces_error_and_stores_nothing() {
        let warehouse = Arc::new(FakeWarehouse {
            fail_connect: true,
            ..FakeWarehouse::default()
        });
        let core = MonitorCore::new(&settings(), warehouse.clone());

        let error = core.connect("u1", payload(false)).await.expect_err("connect fails");
        assert_eq!(error.kind(), "failed_connection");
        assert_eq!(warehouse.connect_count(), 3);
        assert!(!core.status("u1").await.expect("status").connected);
        assert!(core.scheduler().job("u1").await.is_none());
    }

    #[tokio::test]
    async fn missing_fields_fail_before_any_connect() {
        let warehouse = Arc::new(FakeWarehouse::default());
        let core = MonitorCore::new(&settings(), warehouse.clone());
        let error = core
            .connect(
                "u1",
                ConnectPayload {
                    password: None,
                    ..payload(false)
                },
            )
            .await
            .expect_err("validation");
        assert!(matches!(error, AppError::Validation(_)));
        assert_eq!(warehouse.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_stops_monitoring() {
        let core = MonitorCore::new(&settings(), Arc::new(FakeWarehouse::default()));
        core.connect("u1", payload(false)).await.expect("connect");
        tokio::time::sleep(Duration::from_millis(10)).await;

        core.disconnect("u1").await.expect("disconnect");
        core.disconnect("u1").await.expect("second disconnect");

        let status = core.status("u1").await.expect("status");
        assert!(!status.connected);
        assert!(!status.monitoring);

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(core.metrics("u1", None).expect("metrics").total, 1);
    }

    #[tokio::test]
    async fn metrics_limit_is_capped_at_capacity() {
        let core = MonitorCore::new(&settings(), Arc::new(FakeWarehouse::default()));
        let metrics = core.metrics("nobody", Some(10_000)).expect("metrics");
        assert!(metrics.metrics.is_empty());
        assert_eq!(metrics.total, 0);
    }
}
