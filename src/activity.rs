//! Leveled activity lines (INFO / SUCCESS / WARNING / ERROR) for whoever
//! watches the poller: every line goes to `tracing`, into a small ring of
//! recent entries, and optionally into the store's `activity_log` table.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::storage::Database;
use crate::types::{now_ts, LogEntry, LogLevel};

const DEFAULT_CAPACITY: usize = 200;

#[derive(Clone)]
pub struct ActivityLog {
    recent: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    store: Option<Arc<Database>>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            recent: Arc::new(Mutex::new(VecDeque::new())),
            capacity: DEFAULT_CAPACITY,
            store: None,
        }
    }

    /// Also persist every line into `db`.
    pub fn persistent(db: Arc<Database>) -> Self {
        Self {
            store: Some(db),
            ..Self::new()
        }
    }

    pub async fn record(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: now_ts(),
            level,
            message: message.into(),
        };

        match level {
            LogLevel::Info => info!(level = level.as_str(), "{}", entry.message),
            LogLevel::Success => info!(level = level.as_str(), "{}", entry.message),
            LogLevel::Warning => warn!(level = level.as_str(), "{}", entry.message),
            LogLevel::Error => error!(level = level.as_str(), "{}", entry.message),
        }

        {
            let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }

        if let Some(db) = &self.store {
            if let Err(e) = db.insert_log(&entry).await {
                warn!(error = %e, "Persisting activity line failed");
            }
        }
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message).await
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.record(LogLevel::Success, message).await
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.record(LogLevel::Warning, message).await
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message).await
    }

    /// Newest first, at most `limit` entries.
    pub fn latest(&self, limit: usize) -> Vec<LogEntry> {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }
}
