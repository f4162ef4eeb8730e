//! Mail transport: one inbound (IMAP) and one outbound (SMTP) session,
//! each reconnected on failure.
mod client;
mod imap;
mod smtp;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::errors::AppResult;

pub use client::MailClient;
pub use imap::ImapInbound;
pub use smtp::{compose, SmtpOutbound};

/// One message as it came off the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub native_id: String,
    pub raw: Vec<u8>,
    pub folder: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle of one session half.
pub(crate) enum Link<S> {
    Disconnected,
    Connecting,
    Connected(S),
}

impl<S> Link<S> {
    pub(crate) fn state(&self) -> LinkState {
        match self {
            Link::Disconnected => LinkState::Disconnected,
            Link::Connecting => LinkState::Connecting,
            Link::Connected(_) => LinkState::Connected,
        }
    }

    pub(crate) fn take(&mut self) -> Option<S> {
        match std::mem::replace(self, Link::Disconnected) {
            Link::Connected(session) => Some(session),
            _ => None,
        }
    }
}

#[async_trait]
pub trait InboundSession: Send + Sync {
    /// Selects `folder`; returns its UIDVALIDITY when the server reports one.
    async fn select(&mut self, folder: &str) -> AppResult<Option<u32>>;

    /// UIDs in the selected folder, all of them or only those above `after`.
    async fn search_uids(&mut self, after: Option<u32>) -> AppResult<Vec<u32>>;

    /// Raw bytes for `uids`. A message that fails on its own is logged and
    /// left out; `Err` means the fetch command itself failed.
    async fn fetch_raw(&mut self, uids: &[u32]) -> AppResult<Vec<(u32, Vec<u8>)>>;

    async fn logout(&mut self) -> AppResult<()>;
}

#[async_trait]
pub trait OutboundSession: Send + Sync {
    async fn send(&mut self, mail: &OutgoingMail) -> AppResult<()>;

    async fn quit(&mut self) -> AppResult<()>;
}

/// Opens fresh sessions; the seam between [`MailClient`] and the network.
#[async_trait]
pub trait SessionOpener: Send + Sync {
    async fn open_inbound(&self, config: &ConnectionConfig) -> AppResult<Box<dyn InboundSession>>;

    async fn open_outbound(
        &self,
        config: &ConnectionConfig,
    ) -> AppResult<Box<dyn OutboundSession>>;
}

/// IMAP over implicit TLS plus SMTP through lettre.
pub struct NetworkOpener;

#[async_trait]
impl SessionOpener for NetworkOpener {
    async fn open_inbound(&self, config: &ConnectionConfig) -> AppResult<Box<dyn InboundSession>> {
        Ok(Box::new(ImapInbound::connect(config).await?))
    }

    async fn open_outbound(
        &self,
        config: &ConnectionConfig,
    ) -> AppResult<Box<dyn OutboundSession>> {
        Ok(Box::new(SmtpOutbound::connect(config).await?))
    }
}
