use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    FetchedMessage, InboundSession, Link, LinkState, OutboundSession, OutgoingMail,
    SessionOpener,
};
use crate::config::{ConnectionConfig, MailSettings, PollerSettings};
use crate::errors::{AppError, AppResult};
use crate::types::FolderCursor;

/// The connected pair of sessions the poller works through.
///
/// Each half moves `Disconnected -> Connecting -> Connected` and drops back
/// to `Disconnected` on any failed operation; the next attempt reconnects.
pub struct MailClient {
    settings: MailSettings,
    policy: PollerSettings,
    opener: Arc<dyn SessionOpener>,
    config: Option<ConnectionConfig>,
    inbound: Link<Box<dyn InboundSession>>,
    outbound: Link<Box<dyn OutboundSession>>,
    cursors: HashMap<String, FolderCursor>,
}

impl MailClient {
    pub fn new(
        settings: MailSettings,
        policy: PollerSettings,
        opener: Arc<dyn SessionOpener>,
    ) -> Self {
        Self {
            settings,
            policy,
            opener,
            config: None,
            inbound: Link::Disconnected,
            outbound: Link::Disconnected,
            cursors: HashMap::new(),
        }
    }

    /// Resume reading folders where an earlier client left off.
    pub fn restore_cursors(&mut self, cursors: HashMap<String, FolderCursor>) {
        self.cursors = cursors;
    }

    /// Highest UID listed so far per folder.
    pub fn cursors(&self) -> &HashMap<String, FolderCursor> {
        &self.cursors
    }

    pub fn inbound_state(&self) -> LinkState {
        self.inbound.state()
    }

    pub fn outbound_state(&self) -> LinkState {
        self.outbound.state()
    }

    /// Opens both halves. Fails with `Config` before touching the network
    /// when a setting is missing or malformed.
    pub async fn connect(&mut self) -> AppResult<()> {
        let config = self.settings.validate()?;
        self.config = Some(config.clone());

        self.open_inbound(&config).await?;
        self.open_outbound(&config).await?;

        info!(
            imap = %config.imap_host,
            smtp = %config.smtp_host,
            account = %config.address,
            "Connected to mail servers"
        );
        Ok(())
    }

    async fn open_inbound(&mut self, config: &ConnectionConfig) -> AppResult<()> {
        self.inbound = Link::Connecting;
        match self.opener.open_inbound(config).await {
            Ok(session) => {
                self.inbound = Link::Connected(session);
                Ok(())
            }
            Err(e) => {
                self.inbound = Link::Disconnected;
                Err(e)
            }
        }
    }

    async fn open_outbound(&mut self, config: &ConnectionConfig) -> AppResult<()> {
        self.outbound = Link::Connecting;
        match self.opener.open_outbound(config).await {
            Ok(session) => {
                self.outbound = Link::Connected(session);
                Ok(())
            }
            Err(e) => {
                self.outbound = Link::Disconnected;
                Err(e)
            }
        }
    }

    fn connection_config(&mut self) -> AppResult<ConnectionConfig> {
        match &self.config {
            Some(config) => Ok(config.clone()),
            None => {
                let config = self.settings.validate()?;
                self.config = Some(config.clone());
                Ok(config)
            }
        }
    }

    async fn drop_inbound(&mut self) {
        if let Some(mut session) = self.inbound.take() {
            if let Err(e) = session.logout().await {
                debug!(error = %e, "Ignoring error while closing stale inbound session");
            }
        }
    }

    async fn drop_outbound(&mut self) {
        if let Some(mut session) = self.outbound.take() {
            if let Err(e) = session.quit().await {
                debug!(error = %e, "Ignoring error while closing stale outbound session");
            }
        }
    }

    pub async fn reconnect_inbound(&mut self) -> AppResult<()> {
        self.drop_inbound().await;
        let config = self.connection_config()?;
        self.open_inbound(&config).await?;
        info!("Reconnected inbound session");
        Ok(())
    }

    pub async fn reconnect_outbound(&mut self) -> AppResult<()> {
        self.drop_outbound().await;
        let config = self.connection_config()?;
        self.open_outbound(&config).await?;
        info!("Reconnected outbound session");
        Ok(())
    }

    /// Newest-first messages of every configured folder, in folder order.
    ///
    /// Only UIDs above the folder's cursor are listed; a folder without a
    /// cursor, or whose UIDVALIDITY changed, yields its newest `fetch_limit`
    /// messages. When more than `fetch_limit` new messages are waiting the
    /// oldest of them come first, so later cycles catch up on the rest.
    ///
    /// A folder whose select, search or fetch fails contributes nothing and
    /// the inbound half is reconnected before the next folder. Only a
    /// missing inbound session is reported as an error.
    pub async fn fetch_messages(&mut self) -> AppResult<Vec<FetchedMessage>> {
        if self.inbound.state() != LinkState::Connected {
            return Err(AppError::Connection(
                "inbound session is not connected".to_string(),
            ));
        }

        let folders = self.policy.folders.clone();
        let mut fetched = Vec::new();

        for folder in &folders {
            if self.inbound.state() != LinkState::Connected {
                warn!(folder = %folder, "Inbound session lost; skipping remaining folders");
                break;
            }

            match self.fetch_folder(folder).await {
                Ok(batch) => {
                    debug!(folder = %folder, count = batch.len(), "Folder fetched");
                    fetched.extend(batch);
                }
                Err(e) => {
                    warn!(folder = %folder, error = %e, "Skipping folder");
                    if let Err(e) = self.reconnect_inbound().await {
                        warn!(error = %e, "Inbound reconnect failed");
                    }
                }
            }
        }

        Ok(fetched)
    }

    async fn fetch_folder(&mut self, folder: &str) -> AppResult<Vec<FetchedMessage>> {
        let limit = self.policy.fetch_limit.max(1);
        let stored = self.cursors.get(folder).copied();
        let Link::Connected(session) = &mut self.inbound else {
            return Err(AppError::Connection(
                "inbound session is not connected".to_string(),
            ));
        };

        let uid_validity = session.select(folder).await?.unwrap_or(0);
        let after = stored
            .filter(|c| c.uid_validity == uid_validity)
            .map(|c| c.highest_uid);
        if stored.is_some() && after.is_none() {
            info!(folder = %folder, uid_validity, "UIDVALIDITY changed; reading folder afresh");
        }

        let mut uids = session.search_uids(after).await?;
        uids.sort_unstable_by(|a, b| b.cmp(a));
        if uids.len() > limit {
            uids = match after {
                Some(_) => uids.split_off(uids.len() - limit),
                None => {
                    uids.truncate(limit);
                    uids
                }
            };
        }

        let raw = if uids.is_empty() {
            Vec::new()
        } else {
            session.fetch_raw(&uids).await?
        };

        let highest_uid = uids.first().copied().or(after).unwrap_or(0);
        self.cursors.insert(
            folder.to_string(),
            FolderCursor {
                uid_validity,
                highest_uid,
            },
        );

        Ok(raw
            .into_iter()
            .map(|(uid, raw)| FetchedMessage {
                native_id: uid.to_string(),
                raw,
                folder: folder.to_string(),
            })
            .collect())
    }

    /// Sends `mail`, reconnecting the outbound half before each retry.
    /// Returns `false` once every attempt has failed.
    pub async fn send_message(&mut self, mail: &OutgoingMail) -> bool {
        let attempts = self.policy.send_attempts.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 || self.outbound.state() != LinkState::Connected {
                if let Err(e) = self.reconnect_outbound().await {
                    warn!(attempt, error = %e, "Outbound reconnect failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.send_retry_delay).await;
                    }
                    continue;
                }
            }

            let result = match &mut self.outbound {
                Link::Connected(session) => session.send(mail).await,
                _ => Err(AppError::Connection(
                    "outbound session is not connected".to_string(),
                )),
            };

            match result {
                Ok(()) => {
                    info!(to = %mail.to, subject = %mail.subject, attempt, "Mail sent");
                    return true;
                }
                Err(e) => {
                    warn!(to = %mail.to, attempt, error = %e, "Sending mail failed");
                    self.drop_outbound().await;
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.send_retry_delay).await;
                    }
                }
            }
        }

        warn!(to = %mail.to, attempts, "Giving up on mail after all attempts");
        false
    }

    /// Closes both halves; failures are logged and swallowed.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.inbound.take() {
            match session.logout().await {
                Ok(()) => info!("Inbound session closed"),
                Err(e) => warn!(error = %e, "Closing inbound session failed"),
            }
        }
        if let Some(mut session) = self.outbound.take() {
            match session.quit().await {
                Ok(()) => info!("Outbound session closed"),
                Err(e) => warn!(error = %e, "Closing outbound session failed"),
            }
        }
    }
}
