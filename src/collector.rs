use crate::credentials::CredentialStore;
use crate::errors::{AppError, AppResult};
use crate::history::HistoryStore;
use crate::models::{AppSettings, MetricSample, UserCredential};
use crate::redaction::Redactor;
use crate::warehouse::{numeric_column, Dialect, Row, Warehouse, WarehouseSession};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::time::{timeout, Duration};

pub const ACTIVITY_WINDOW_MINUTES: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum CollectOutcome {
    Collected(MetricSample),
    /// Another collection for the same user was still running.
    Skipped,
    NoCredential,
    Failed(String),
}

impl CollectOutcome {
    pub fn sample(&self) -> Option<&MetricSample> {
        match self {
            Self::Collected(sample) => Some(sample),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorTimeouts {
    pub connect: Duration,
    pub query: Duration,
    pub close: Duration,
}

impl Default for CollectorTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            query: Duration::from_secs(60),
            close: Duration::from_secs(10),
        }
    }
}

impl CollectorTimeouts {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            connect: Duration::from_secs(settings.connect_timeout_secs),
            query: Duration::from_secs(settings.query_timeout_secs),
            close: Duration::from_secs(settings.close_timeout_secs),
        }
    }
}

/// Aggregation over the warehouse's own query history for the trailing window.
pub fn activity_query(dialect: Dialect, window_minutes: u32) -> String {
    match dialect {
        Dialect::Snowflake => format!(
            "SELECT
                COUNT(*) AS query_count,
                SUM(TOTAL_ELAPSED_TIME) AS total_time,
                AVG(TOTAL_ELAPSED_TIME) AS avg_time
            FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY
            WHERE START_TIME > DATEADD(minute, -{}, CURRENT_TIMESTAMP())",
            window_minutes
        ),
        Dialect::Sqlite => format!(
            "SELECT
                COUNT(*) AS query_count,
                SUM(total_elapsed_time) AS total_time,
                AVG(total_elapsed_time) AS avg_time
            FROM query_history
            WHERE start_time > datetime('now', '-{} minutes')",
            window_minutes
        ),
    }
}

/// Maps the summary row; absent rows and null or non-numeric fields read as zero.
pub fn map_sample(row: Option<&Row>, timestamp: DateTime<Utc>) -> MetricSample {
    let Some(row) = row else {
        return MetricSample::empty(timestamp);
    };
    let read = |column: &str| numeric_column(row, column).unwrap_or(0.0).max(0.0);

    MetricSample {
        timestamp,
        query_count: read("QUERY_COUNT").round() as u64,
        total_time: read("TOTAL_TIME"),
        avg_time: read("AVG_TIME"),
    }
}

struct InFlightGuard {
    in_flight: Arc<StdMutex<HashSet<String>>>,
    user_id: String,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<StdMutex<HashSet<String>>>, user_id: &str) -> Option<Self> {
        let mut running = in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !running.insert(user_id.to_string()) {
            return None;
        }
        Some(Self {
            in_flight: in_flight.clone(),
            user_id: user_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut running = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        running.remove(&self.user_id);
    }
}

/// Owns an open warehouse session. `release` closes it; if the collection future is
/// dropped first, the close is spawned onto the runtime instead.
struct SessionGuard {
    session: Option<Box<dyn WarehouseSession>>,
    close_timeout: Duration,
    user_id: String,
}

impl SessionGuard {
    fn new(session: Box<dyn WarehouseSession>, close_timeout: Duration, user_id: &str) -> Self {
        Self {
            session: Some(session),
            close_timeout,
            user_id: user_id.to_string(),
        }
    }

    fn session(&mut self) -> AppResult<&mut (dyn WarehouseSession + 'static)> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| AppError::Internal("warehouse session already released".to_string()))
    }

    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            close_session(session, self.close_timeout, self.user_id.clone()).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_session(session, self.close_timeout, self.user_id.clone()));
            }
            Err(_) => {
                tracing::warn!(user_id = %self.user_id, "no runtime to close abandoned warehouse session");
            }
        }
    }
}

pub(crate) async fn close_session(session: Box<dyn WarehouseSession>, close_timeout: Duration, user_id: String) {
    let session_id = session.id();
    match timeout(close_timeout, session.close()).await {
        Ok(Ok(())) => tracing::debug!(user_id = %user_id, session_id = %session_id, "warehouse session closed"),
        Ok(Err(error)) => {
            tracing::warn!(user_id = %user_id, session_id = %session_id, error = %error, "error disconnecting from warehouse")
        }
        Err(_) => tracing::warn!(
            user_id = %user_id,
            session_id = %session_id,
            timeout_secs = close_timeout.as_secs(),
            "warehouse disconnect timed out"
        ),
    }
}

/// One collection job: credential lookup, connect, aggregate, append, release.
pub struct Collector {
    credentials: Arc<dyn CredentialStore>,
    history: Arc<dyn HistoryStore>,
    warehouse: Arc<dyn Warehouse>,
    timeouts: CollectorTimeouts,
    window_minutes: u32,
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

impl Collector {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        history: Arc<dyn HistoryStore>,
        warehouse: Arc<dyn Warehouse>,
        timeouts: CollectorTimeouts,
    ) -> Self {
        Self {
            credentials,
            history,
            warehouse,
            timeouts,
            window_minutes: ACTIVITY_WINDOW_MINUTES,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn timeouts(&self) -> CollectorTimeouts {
        self.timeouts
    }

    pub fn is_in_flight(&self, user_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|running| running.contains(user_id))
            .unwrap_or(false)
    }

    /// Runs unattended: every failure is logged and reported in the outcome, never raised.
    pub async fn collect(&self, user_id: &str) -> CollectOutcome {
        let Some(_in_flight) = InFlightGuard::acquire(&self.in_flight, user_id) else {
            tracing::info!(user_id = %user_id, "collection already running; skipping");
            return CollectOutcome::Skipped;
        };

        let credential = match self.credentials.get(user_id) {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                tracing::info!(user_id = %user_id, "no credentials found; skipping collection");
                return CollectOutcome::NoCredential;
            }
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "failed to load credentials");
                return CollectOutcome::Failed(error.to_string());
            }
        };

        tracing::debug!(user_id = %user_id, warehouse = self.warehouse.name(), "starting metrics collection");
        match self.collect_with(&credential).await {
            Ok(sample) => {
                tracing::info!(
                    user_id = %user_id,
                    query_count = sample.query_count,
                    total_time = sample.total_time,
                    avg_time = sample.avg_time,
                    "metrics collected"
                );
                CollectOutcome::Collected(sample)
            }
            Err(error) => {
                let message = Redactor::new(true)
                    .with_secret(&credential.password)
                    .redact(&error.to_string())
                    .content;
                tracing::warn!(user_id = %user_id, error = %message, "metrics collection failed");
                CollectOutcome::Failed(message)
            }
        }
    }

    async fn collect_with(&self, credential: &UserCredential) -> AppResult<MetricSample> {
        let session = timeout(self.timeouts.connect, self.warehouse.connect(credential))
            .await
            .map_err(|_| {
                AppError::Timeout(format!(
                    "warehouse connect did not complete within {}s",
                    self.timeouts.connect.as_secs()
                ))
            })??;

        let mut guard = SessionGuard::new(session, self.timeouts.close, &credential.user_id);
        let result = self.query_sample(&mut guard).await;
        guard.release().await;

        let sample = result?;
        self.history.append(&credential.user_id, sample.clone())?;
        Ok(sample)
    }

    async fn query_sample(&self, guard: &mut SessionGuard) -> AppResult<MetricSample> {
        let sql = activity_query(self.warehouse.dialect(), self.window_minutes);
        let session = guard.session()?;
        let rows = timeout(self.timeouts.query, session.execute(&sql))
            .await
            .map_err(|_| {
                AppError::Timeout(format!(
                    "warehouse query did not complete within {}s",
                    self.timeouts.query.as_secs()
                ))
            })??;
        Ok(map_sample(rows.first(), Utc::now()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::errors::{AppError, AppResult};
    use crate::models::UserCredential;
    use crate::warehouse::{Dialect, Row, Warehouse, WarehouseSession};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    /// Scripted warehouse for collector and scheduler tests.
    #[derive(Default)]
    pub struct FakeWarehouse {
        pub connect_delay: Duration,
        pub query_delay: Duration,
        pub fail_connect: bool,
        /// Fails this many connects before succeeding.
        pub failing_connects: usize,
        pub fail_query: bool,
        pub empty_result: bool,
        pub connects: Arc<AtomicUsize>,
        pub closes: Arc<AtomicUsize>,
    }

    impl FakeWarehouse {
        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Warehouse for FakeWarehouse {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn dialect(&self) -> Dialect {
            Dialect::Snowflake
        }

        async fn connect(&self, _credential: &UserCredential) -> AppResult<Box<dyn WarehouseSession>> {
            let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            if self.fail_connect || attempt < self.failing_connects {
                return Err(AppError::connection("Failed to connect to Snowflake.", "network unreachable"));
            }
            Ok(Box::new(FakeSession {
                query_delay: self.query_delay,
                fail_query: self.fail_query,
                empty_result: self.empty_result,
                closes: self.closes.clone(),
            }))
        }
    }

    struct FakeSession {
        query_delay: Duration,
        fail_query: bool,
        empty_result: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WarehouseSession for FakeSession {
        fn id(&self) -> String {
            "fake-session".to_string()
        }

        async fn execute(&mut self, _sql: &str) -> AppResult<Vec<Row>> {
            if !self.query_delay.is_zero() {
                tokio::time::sleep(self.query_delay).await;
            }
            if self.fail_query {
                return Err(AppError::Query("SQL compilation error".to_string()));
            }
            if self.empty_result {
                return Ok(Vec::new());
            }
            let mut row = Row::new();
            row.insert("QUERY_COUNT".to_string(), json!("7"));
            row.insert("TOTAL_TIME".to_string(), json!("700"));
            row.insert("AVG_TIME".to_string(), json!("100"));
            Ok(vec![row])
        }

        async fn close(self: Box<Self>) -> AppResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn credential(user_id: &str) -> UserCredential {
        UserCredential {
            user_id: user_id.to_string(),
            host_account: "xy12345".to_string(),
            username: "analyst".to_string(),
            password: "correct-horse".to_string(),
        }
    }
}
