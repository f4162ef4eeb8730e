#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mailweave::config::{AppConfig, ConnectionConfig, MailSettings, PollerSettings};
use mailweave::errors::{AppError, AppResult};
use mailweave::transport::{InboundSession, OutboundSession, OutgoingMail, SessionOpener};

/// Scripted mail servers shared by every session a [`FakeOpener`] hands out.
#[derive(Default)]
pub struct FakeState {
    pub inbound_failures: AtomicUsize,
    pub outbound_failures: AtomicUsize,
    pub send_failures: AtomicUsize,
    pub inbound_opens: AtomicUsize,
    pub outbound_opens: AtomicUsize,
    pub logouts: AtomicUsize,
    pub mailbox: Mutex<HashMap<String, Vec<(u32, Vec<u8>)>>>,
    pub broken_folders: Mutex<HashSet<String>>,
    pub uid_validity: Mutex<HashMap<String, u32>>,
    pub searches: Mutex<Vec<(String, Option<u32>)>>,
    pub sent: Mutex<Vec<OutgoingMail>>,
}

impl FakeState {
    pub fn put(&self, folder: &str, uid: u32, raw: Vec<u8>) {
        self.mailbox
            .lock()
            .unwrap()
            .entry(folder.to_string())
            .or_default()
            .push((uid, raw));
    }

    pub fn break_folder(&self, folder: &str) {
        self.broken_folders.lock().unwrap().insert(folder.to_string());
    }

    pub fn repair_folder(&self, folder: &str) {
        self.broken_folders.lock().unwrap().remove(folder);
    }

    /// Simulates the server renumbering `folder`.
    pub fn set_uid_validity(&self, folder: &str, uid_validity: u32) {
        self.uid_validity
            .lock()
            .unwrap()
            .insert(folder.to_string(), uid_validity);
    }
}

#[derive(Clone, Default)]
pub struct FakeOpener {
    pub state: Arc<FakeState>,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl SessionOpener for FakeOpener {
    async fn open_inbound(&self, _config: &ConnectionConfig) -> AppResult<Box<dyn InboundSession>> {
        self.state.inbound_opens.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.state.inbound_failures) {
            return Err(AppError::Connection("IMAP login refused".into()));
        }
        Ok(Box::new(FakeInbound {
            state: self.state.clone(),
            selected: None,
        }))
    }

    async fn open_outbound(
        &self,
        _config: &ConnectionConfig,
    ) -> AppResult<Box<dyn OutboundSession>> {
        self.state.outbound_opens.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.state.outbound_failures) {
            return Err(AppError::Connection("SMTP login refused".into()));
        }
        Ok(Box::new(FakeOutbound {
            state: self.state.clone(),
        }))
    }
}

struct FakeInbound {
    state: Arc<FakeState>,
    selected: Option<String>,
}

#[async_trait]
impl InboundSession for FakeInbound {
    async fn select(&mut self, folder: &str) -> AppResult<Option<u32>> {
        if self.state.broken_folders.lock().unwrap().contains(folder) {
            return Err(AppError::Connection(format!("NO [NONEXISTENT] {folder}")));
        }
        self.selected = Some(folder.to_string());
        let validity = self.state.uid_validity.lock().unwrap().get(folder).copied();
        Ok(Some(validity.unwrap_or(1)))
    }

    async fn search_uids(&mut self, after: Option<u32>) -> AppResult<Vec<u32>> {
        let folder = self.selected.clone().unwrap_or_default();
        self.state.searches.lock().unwrap().push((folder.clone(), after));
        let mailbox = self.state.mailbox.lock().unwrap();
        Ok(mailbox
            .get(&folder)
            .map(|msgs| {
                msgs.iter()
                    .map(|(uid, _)| *uid)
                    .filter(|uid| after.map_or(true, |floor| *uid > floor))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_raw(&mut self, uids: &[u32]) -> AppResult<Vec<(u32, Vec<u8>)>> {
        let folder = self.selected.clone().unwrap_or_default();
        let mailbox = self.state.mailbox.lock().unwrap();
        let msgs = mailbox.get(&folder).cloned().unwrap_or_default();
        Ok(uids
            .iter()
            .filter_map(|uid| msgs.iter().find(|(u, _)| u == uid).cloned())
            .collect())
    }

    async fn logout(&mut self) -> AppResult<()> {
        self.state.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeOutbound {
    state: Arc<FakeState>,
}

#[async_trait]
impl OutboundSession for FakeOutbound {
    async fn send(&mut self, mail: &OutgoingMail) -> AppResult<()> {
        if take_failure(&self.state.send_failures) {
            return Err(AppError::Connection("421 service not available".into()));
        }
        self.state.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }

    async fn quit(&mut self) -> AppResult<()> {
        Ok(())
    }
}

pub fn valid_settings() -> MailSettings {
    MailSettings {
        imap_server: Some("imap.example.com".into()),
        imap_port: Some("993".into()),
        smtp_server: Some("smtp.example.com".into()),
        smtp_port: Some("465".into()),
        email_address: Some("bot@example.com".into()),
        email_password: Some("secret".into()),
    }
}

pub fn fast_policy(folders: &[&str]) -> PollerSettings {
    PollerSettings {
        poll_interval: Duration::from_millis(20),
        max_connect_retries: 3,
        folders: folders.iter().map(|f| f.to_string()).collect(),
        fetch_limit: 50,
        send_attempts: 3,
        send_retry_delay: Duration::from_millis(1),
        stop_timeout: Duration::from_secs(5),
    }
}

pub fn fast_config(folders: &[&str]) -> AppConfig {
    AppConfig {
        mail: valid_settings(),
        poller: fast_policy(folders),
    }
}

/// A minimal RFC 5322 message. `extra` lines go verbatim into the header.
pub fn raw_mail(message_id: &str, subject: &str, extra: &[&str], body: &str) -> Vec<u8> {
    let mut out = String::new();
    out.push_str("From: Alice Example <alice@example.com>\r\n");
    out.push_str("To: bot@example.com\r\n");
    out.push_str(&format!("Subject: {subject}\r\n"));
    if !message_id.is_empty() {
        out.push_str(&format!("Message-ID: {message_id}\r\n"));
    }
    for line in extra {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
    out.push_str(body);
    out.push_str("\r\n");
    out.into_bytes()
}

pub const DATE: &str = "Date: Tue, 1 Jul 2025 10:00:00 +0000";
