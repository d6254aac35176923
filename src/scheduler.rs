use crate::collector::{CollectOutcome, Collector};
use crate::credentials::CredentialStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant, MissedTickBehavior};

pub const DEFAULT_COLLECTION_PERIOD: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);

pub type ExecutorFuture = Pin<Box<dyn Future<Output = CollectOutcome> + Send>>;
pub type Executor = Arc<dyn Fn(String) -> ExecutorFuture + Send + Sync>;

pub fn collector_executor(collector: Arc<Collector>) -> Executor {
    Arc::new(move |user_id: String| -> ExecutorFuture {
        let collector = collector.clone();
        Box::pin(async move { collector.collect(&user_id).await })
    })
}

struct ScheduledJob {
    period: Duration,
    registered_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub user_id: String,
    pub period_ms: u64,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub collected: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Owns the per-user collection timers and the process-wide sweep.
#[derive(Clone)]
pub struct Scheduler {
    credentials: Arc<dyn CredentialStore>,
    executor: Executor,
    jobs: Arc<Mutex<HashMap<String, ScheduledJob>>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
    default_period: Duration,
    sweep_period: Duration,
}

impl Scheduler {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        executor: Executor,
        default_period: Duration,
        sweep_period: Duration,
    ) -> Self {
        Self {
            credentials,
            executor,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Arc::new(Mutex::new(None)),
            default_period: non_zero(default_period, DEFAULT_COLLECTION_PERIOD),
            sweep_period: non_zero(sweep_period, DEFAULT_SWEEP_PERIOD),
        }
    }

    /// Collects once right away, then every `period`. Replaces any job the user already has.
    /// Returns `None` without starting anything if the user has no stored credential.
    pub async fn register_user(&self, user_id: &str, period: Option<Duration>) -> Option<JobInfo> {
        let period = non_zero(period.unwrap_or(self.default_period), self.default_period);
        let mut jobs = self.jobs.lock().await;

        if let Some(previous) = jobs.remove(user_id) {
            previous.handle.abort();
            let _ = previous.handle.await;
            tracing::info!(user_id = %user_id, "replaced existing collection job");
        }

        // Disconnect deletes the credential before taking this lock, so a credential seen
        // here is either still present or about to be unregistered after us.
        match self.credentials.get(user_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::info!(user_id = %user_id, "credential removed before registration; not scheduling");
                return None;
            }
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "failed to check credential before registration");
                return None;
            }
        }

        let executor = self.executor.clone();
        let owner = user_id.to_string();
        let handle = tokio::spawn(async move {
            run_collection(&executor, &owner, "registration").await;

            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                run_collection(&executor, &owner, "tick").await;
            }
        });

        let registered_at = Utc::now();
        jobs.insert(
            user_id.to_string(),
            ScheduledJob {
                period,
                registered_at,
                handle,
            },
        );

        tracing::info!(
            user_id = %user_id,
            period_secs = period.as_secs(),
            "started metrics collection"
        );

        Some(JobInfo {
            user_id: user_id.to_string(),
            period_ms: period.as_millis() as u64,
            registered_at,
        })
    }

    /// Cancels the user's recurring job. Returns whether one existed.
    pub async fn unregister_user(&self, user_id: &str) -> bool {
        let removed = {
            let mut jobs = self.jobs.lock().await;
            jobs.remove(user_id)
        };
        match removed {
            Some(job) => {
                job.handle.abort();
                tracing::info!(user_id = %user_id, "stopped metrics collection");
                true
            }
            None => false,
        }
    }

    pub async fn job(&self, user_id: &str) -> Option<JobInfo> {
        let jobs = self.jobs.lock().await;
        jobs.get(user_id).map(|job| JobInfo {
            user_id: user_id.to_string(),
            period_ms: job.period.as_millis() as u64,
            registered_at: job.registered_at,
        })
    }

    pub async fn active_users(&self) -> Vec<String> {
        let jobs = self.jobs.lock().await;
        let mut users = jobs.keys().cloned().collect::<Vec<_>>();
        users.sort();
        users
    }

    /// Triggers one collection for every user that currently has a credential.
    pub async fn sweep_all(&self) -> SweepReport {
        let user_ids = match self.credentials.user_ids() {
            Ok(user_ids) => user_ids,
            Err(error) => {
                tracing::warn!(error = %error, "failed to list connected users for sweep");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            attempted: user_ids.len(),
            ..SweepReport::default()
        };
        let mut tasks = JoinSet::new();
        for user_id in user_ids {
            tasks.spawn((self.executor)(user_id));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(CollectOutcome::Collected(_)) => report.collected += 1,
                Ok(CollectOutcome::Skipped) | Ok(CollectOutcome::NoCredential) => report.skipped += 1,
                Ok(CollectOutcome::Failed(_)) => report.failed += 1,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(error = %error, "sweep collection task aborted");
                }
            }
        }

        tracing::debug!(
            attempted = report.attempted,
            collected = report.collected,
            skipped = report.skipped,
            failed = report.failed,
            "sweep finished"
        );
        report
    }

    /// Sweeps immediately and then every sweep period. Only the first call starts the loop.
    pub async fn start_background_monitoring(&self) -> bool {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            tracing::warn!("background monitoring already running");
            return false;
        }

        let scheduler = self.clone();
        let period = self.sweep_period;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                scheduler.sweep_all().await;
            }
        }));

        tracing::info!(period_secs = period.as_secs(), "background monitoring started");
        true
    }

    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }
        let mut jobs = self.jobs.lock().await;
        let count = jobs.len();
        for (_, job) in jobs.drain() {
            job.handle.abort();
        }
        tracing::info!(jobs = count, "scheduler stopped");
    }
}

async fn run_collection(executor: &Executor, user_id: &str, trigger: &'static str) {
    match executor(user_id.to_string()).await {
        CollectOutcome::Collected(_) => {}
        CollectOutcome::Skipped => tracing::debug!(user_id = %user_id, trigger, "collection skipped"),
        CollectOutcome::NoCredential => tracing::debug!(user_id = %user_id, trigger, "no credential for scheduled user"),
        CollectOutcome::Failed(_) => tracing::debug!(user_id = %user_id, trigger, "scheduled collection failed"),
    }
}

fn non_zero(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}
