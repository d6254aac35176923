use crate::errors::{AppError, AppResult};
use crate::models::{MetricSample, RecentSamples};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

pub const DEFAULT_RECENT_LIMIT: usize = 20;

/// Append-only, per-user sample history.
pub trait HistoryStore: Send + Sync {
    fn append(&self, user_id: &str, sample: MetricSample) -> AppResult<()>;
    /// The newest `limit` samples in chronological order, plus the user's lifetime sample count.
    fn read_recent(&self, user_id: &str, limit: usize) -> AppResult<RecentSamples>;
}

#[derive(Debug, Default)]
struct UserHistory {
    samples: VecDeque<MetricSample>,
    appended: u64,
}

impl UserHistory {
    fn push(&mut self, sample: MetricSample, capacity: usize) {
        self.samples.push_back(sample);
        self.appended = self.appended.saturating_add(1);
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
    }
}

/// Ring buffer of at most `capacity` samples per user.
#[derive(Debug)]
pub struct InMemoryHistoryStore {
    capacity: usize,
    entries: RwLock<HashMap<String, UserHistory>>,
}

impl InMemoryHistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(DEFAULT_RECENT_LIMIT),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn poisoned() -> AppError {
    AppError::Internal("history store lock poisoned".to_string())
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, user_id: &str, sample: MetricSample) -> AppResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let history = entries.entry(user_id.to_string()).or_default();
        if let Some(last) = history.samples.back() {
            if sample.timestamp < last.timestamp {
                tracing::warn!(user_id = %user_id, "appending sample older than the previous one");
            }
        }
        history.push(sample, self.capacity);
        Ok(())
    }

    fn read_recent(&self, user_id: &str, limit: usize) -> AppResult<RecentSamples> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let Some(history) = entries.get(user_id) else {
            return Ok(RecentSamples::default());
        };

        let skip = history.samples.len().saturating_sub(limit);
        Ok(RecentSamples {
            samples: history.samples.iter().skip(skip).cloned().collect(),
            total: history.appended,
        })
    }
}
