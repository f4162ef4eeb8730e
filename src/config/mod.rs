use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{AppError, AppResult};

/// Connection settings exactly as they were read. Nothing is checked here;
/// `validate` runs at connect time so a missing key surfaces as a
/// configuration error from `connect()`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailSettings {
    pub imap_server: Option<String>,
    pub imap_port: Option<String>,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<String>,
    pub email_address: Option<String>,
    pub email_password: Option<String>,
}

/// Validated, typed connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub address: String,
    pub password: String,
}

impl MailSettings {
    pub fn from_env() -> Self {
        Self {
            imap_server: env::var("IMAP_SERVER").ok(),
            imap_port: env::var("IMAP_PORT").ok(),
            smtp_server: env::var("SMTP_SERVER").ok(),
            smtp_port: env::var("SMTP_PORT").ok(),
            email_address: env::var("EMAIL_ADDRESS").ok(),
            email_password: env::var("EMAIL_PASSWORD").ok(),
        }
    }

    /// Values present in `other` win.
    pub fn merge(self, other: MailSettings) -> Self {
        Self {
            imap_server: other.imap_server.or(self.imap_server),
            imap_port: other.imap_port.or(self.imap_port),
            smtp_server: other.smtp_server.or(self.smtp_server),
            smtp_port: other.smtp_port.or(self.smtp_port),
            email_address: other.email_address.or(self.email_address),
            email_password: other.email_password.or(self.email_password),
        }
    }

    pub fn validate(&self) -> AppResult<ConnectionConfig> {
        let imap_host = required("IMAP_SERVER", &self.imap_server)?;
        let imap_port = port("IMAP_PORT", &self.imap_port)?;
        let smtp_host = required("SMTP_SERVER", &self.smtp_server)?;
        let smtp_port = port("SMTP_PORT", &self.smtp_port)?;
        let address = required("EMAIL_ADDRESS", &self.email_address)?;
        if !address.contains('@') {
            return Err(AppError::Config(format!(
                "EMAIL_ADDRESS is not a mail address: {address}"
            )));
        }
        let password = required("EMAIL_PASSWORD", &self.email_password)?;

        Ok(ConnectionConfig {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            address,
            password,
        })
    }
}

fn required(key: &str, value: &Option<String>) -> AppResult<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(AppError::Config(format!("{key} is not set"))),
    }
}

fn port(key: &str, value: &Option<String>) -> AppResult<u16> {
    let raw = required(key, value)?;
    match raw.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(AppError::Config(format!("{key} is not a valid port: {raw}"))),
    }
}

/// Polling and retry policy.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub max_connect_retries: u32,
    pub folders: Vec<String>,
    pub fetch_limit: usize,
    pub send_attempts: u32,
    pub send_retry_delay: Duration,
    pub stop_timeout: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_connect_retries: 3,
            folders: vec!["INBOX".to_string()],
            fetch_limit: 50,
            send_attempts: 3,
            send_retry_delay: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl PollerSettings {
    /// Defaults, overridden by `MAILWEAVE_*` env vars where set.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(secs) = env_parse::<u64>("MAILWEAVE_POLL_INTERVAL_SECS") {
            settings.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("MAILWEAVE_MAX_CONNECT_RETRIES") {
            settings.max_connect_retries = n.max(1);
        }
        if let Ok(raw) = env::var("MAILWEAVE_FOLDERS") {
            let folders = split_folders(&raw);
            if !folders.is_empty() {
                settings.folders = folders;
            }
        }
        if let Some(n) = env_parse::<usize>("MAILWEAVE_FETCH_LIMIT") {
            settings.fetch_limit = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("MAILWEAVE_SEND_ATTEMPTS") {
            settings.send_attempts = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("MAILWEAVE_SEND_RETRY_DELAY_SECS") {
            settings.send_retry_delay = Duration::from_secs(secs);
        }
        settings
    }

    fn apply(&mut self, file: PollerFile) {
        if let Some(secs) = file.poll_interval_secs {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = file.max_connect_retries {
            self.max_connect_retries = n.max(1);
        }
        if let Some(folders) = file.folders.filter(|f| !f.is_empty()) {
            self.folders = folders;
        }
        if let Some(n) = file.fetch_limit {
            self.fetch_limit = n.max(1);
        }
        if let Some(n) = file.send_attempts {
            self.send_attempts = n.max(1);
        }
        if let Some(secs) = file.send_retry_delay_secs {
            self.send_retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = file.stop_timeout_secs {
            self.stop_timeout = Duration::from_secs(secs);
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn split_folders(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    mail: MailSettings,
    #[serde(default)]
    poller: PollerFile,
}

#[derive(Debug, Default, Deserialize)]
struct PollerFile {
    poll_interval_secs: Option<u64>,
    max_connect_retries: Option<u32>,
    folders: Option<Vec<String>>,
    fetch_limit: Option<usize>,
    send_attempts: Option<u32>,
    send_retry_delay_secs: Option<u64>,
    stop_timeout_secs: Option<u64>,
}

/// Everything the poller needs, built once and handed over at start.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub mail: MailSettings,
    pub poller: PollerSettings,
}

impl AppConfig {
    /// Env first, then the optional TOML file on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self {
            mail: MailSettings::from_env(),
            poller: PollerSettings::from_env(),
        };

        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            config = config.with_toml(&raw)?;
        }

        Ok(config)
    }

    pub fn with_toml(mut self, raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw).context("parsing config TOML")?;
        self.mail = self.mail.merge(file.mail);
        self.poller.apply(file.poller);
        Ok(self)
    }
}

pub fn default_db_path() -> Result<PathBuf> {
    Ok(crate::storage::default_data_dir()?.join(crate::storage::DB_FILE_NAME))
}
