//! IMAP inbound half using async-imap 0.11 with tokio-rustls.
use anyhow::{Context, Result};
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::StreamExt;
use rustls_native_certs::load_native_certs;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use super::InboundSession;
use crate::config::ConnectionConfig;
use crate::errors::{AppError, AppResult};

type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

pub struct ImapInbound {
    session: ImapSession,
}

impl ImapInbound {
    pub async fn connect(config: &ConnectionConfig) -> AppResult<Self> {
        let session = establish(config)
            .await
            .map_err(|e| AppError::Connection(format!("{e:#}")))?;
        debug!(host = %config.imap_host, port = config.imap_port, "IMAP session established");
        Ok(Self { session })
    }
}

async fn establish(config: &ConnectionConfig) -> Result<ImapSession> {
    // Create TLS config with native root certificates
    let mut root_store = RootCertStore::empty();
    for cert in load_native_certs().context("failed to load native certs")? {
        root_store
            .add(&tokio_rustls::rustls::Certificate(cert.0))
            .context("failed to add cert to root store")?;
    }

    let tls_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(tls_config));

    let host = config.imap_host.as_str();
    let tcp = TcpStream::connect((host, config.imap_port))
        .await
        .with_context(|| format!("connecting to {}:{}", host, config.imap_port))?;

    let server_name = ServerName::try_from(host).context("invalid DNS name")?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .context("starting TLS for IMAP")?;

    // Convert tokio AsyncRead/AsyncWrite to futures AsyncRead/AsyncWrite
    let mut client = Client::new(tls_stream.compat());

    let _greeting = client
        .read_response()
        .await
        .context("reading IMAP greeting")?
        .ok_or_else(|| anyhow::anyhow!("unexpected end of stream, expected greeting"))?;

    let session = client
        .login(&config.address, &config.password)
        .await
        .map_err(|(err, _client)| err)
        .context("IMAP login")?;

    Ok(session)
}

#[async_trait]
impl InboundSession for ImapInbound {
    async fn select(&mut self, folder: &str) -> AppResult<Option<u32>> {
        let mailbox = self
            .session
            .select(folder)
            .await
            .map_err(|e| AppError::Connection(format!("selecting folder {folder}: {e}")))?;
        Ok(mailbox.uid_validity)
    }

    async fn search_uids(&mut self, after: Option<u32>) -> AppResult<Vec<u32>> {
        let query = match after {
            Some(uid) => format!("UID {}:*", uid.saturating_add(1)),
            None => "ALL".to_string(),
        };
        let found = self
            .session
            .uid_search(&query)
            .await
            .map_err(|e| AppError::Connection(format!("UID SEARCH {query}: {e}")))?;

        // `n:*` always matches the highest UID, even when it is below n.
        Ok(found
            .into_iter()
            .filter(|uid| after.map_or(true, |floor| *uid > floor))
            .collect())
    }

    async fn fetch_raw(&mut self, uids: &[u32]) -> AppResult<Vec<(u32, Vec<u8>)>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let uid_seq = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");

        // PEEK keeps \Seen untouched; re-fetching is harmless.
        let mut stream = self
            .session
            .uid_fetch(&uid_seq, "(UID BODY.PEEK[])")
            .await
            .map_err(|e| AppError::Connection(format!("UID FETCH {uid_seq}: {e}")))?;

        let mut by_uid = HashMap::new();
        while let Some(fetch_result) = stream.next().await {
            let fetch = match fetch_result {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "Failed to fetch message");
                    continue;
                }
            };

            let Some(uid) = fetch.uid else {
                continue;
            };
            match fetch.body() {
                Some(body) => {
                    by_uid.insert(uid, body.to_vec());
                }
                None => warn!(uid, "Fetched message has no body"),
            }
        }

        // Keep the newest-first order of `uids`.
        Ok(uids
            .iter()
            .filter_map(|uid| by_uid.remove(uid).map(|raw| (*uid, raw)))
            .collect())
    }

    async fn logout(&mut self) -> AppResult<()> {
        self.session
            .logout()
            .await
            .map_err(|e| AppError::Connection(format!("IMAP logout: {e}")))
    }
}
