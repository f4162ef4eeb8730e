//! SMTP outbound half through lettre's async transport.
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use super::{OutboundSession, OutgoingMail};
use crate::config::ConnectionConfig;
use crate::errors::{AppError, AppResult};

const IMPLICIT_TLS_PORT: u16 = 465;

pub struct SmtpOutbound {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpOutbound {
    /// Builds the relay and proves it with a full handshake and login.
    pub async fn connect(config: &ConnectionConfig) -> AppResult<Self> {
        let from: Mailbox = config
            .address
            .parse()
            .map_err(|e| AppError::Config(format!("invalid EMAIL_ADDRESS: {e}")))?;

        let builder = if config.smtp_port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        }
        .map_err(|e| AppError::Config(format!("invalid SMTP host '{}': {e}", config.smtp_host)))?;

        let transport = builder
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.address.clone(),
                config.password.clone(),
            ))
            .build();

        match transport.test_connection().await {
            Ok(true) => {
                debug!(host = %config.smtp_host, port = config.smtp_port, "SMTP relay reachable");
                Ok(Self { transport, from })
            }
            Ok(false) => Err(AppError::Connection(format!(
                "SMTP server {} did not accept the connection",
                config.smtp_host
            ))),
            Err(e) => Err(AppError::Connection(format!("SMTP login failed: {e}"))),
        }
    }
}

/// Builds the outgoing message, threading headers included when given.
pub fn compose(from: &Mailbox, mail: &OutgoingMail) -> AppResult<Message> {
    let to: Mailbox = mail
        .to
        .parse()
        .map_err(|e| AppError::Unexpected(format!("invalid recipient '{}': {e}", mail.to)))?;

    let mut builder = Message::builder()
        .from(from.clone())
        .to(to)
        .subject(mail.subject.clone());

    if let Some(in_reply_to) = mail.in_reply_to.as_ref().filter(|v| !v.trim().is_empty()) {
        builder = builder.in_reply_to(in_reply_to.trim().to_string());
    }
    if !mail.references.is_empty() {
        builder = builder.references(mail.references.join(" "));
    }

    builder
        .header(ContentType::TEXT_PLAIN)
        .body(mail.body.clone())
        .map_err(|e| AppError::Unexpected(format!("failed to build email: {e}")))
}

#[async_trait]
impl OutboundSession for SmtpOutbound {
    async fn send(&mut self, mail: &OutgoingMail) -> AppResult<()> {
        let message = compose(&self.from, mail)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| AppError::Connection(format!("SMTP send error: {e}")))?;
        Ok(())
    }

    // Without the lettre pool every send runs on its own connection, so there
    // is nothing held open to close.
    async fn quit(&mut self) -> AppResult<()> {
        Ok(())
    }
}
