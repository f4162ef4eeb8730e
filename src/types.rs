use chrono::Utc;

/// A conversation grouping. Created by the first message with no known
/// parent; `last_updated` moves forward on every message resolved into it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub subject: String,
    pub last_updated: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: String,
    pub thread_id: String,
    pub from_name: String,
    pub from_email: String,
    pub subject: String,
    pub body: String,
    pub date: i64,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub folder: String,
    pub ingested_at: i64,
}

/// How far a folder has been read. Only meaningful while the server keeps
/// the same `uid_validity`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FolderCursor {
    pub uid_validity: u32,
    pub highest_uid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Success => "SUCCESS",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        match raw {
            "SUCCESS" => LogLevel::Success,
            "WARNING" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
