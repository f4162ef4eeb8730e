use crate::activity::ActivityLog;
use crate::cli::Cli;
use crate::config::{default_db_path, AppConfig};
use crate::decode::split_message_ids;
use crate::errors::AppError;
use crate::poller::{poll_once, Poller, PollerState, StopOutcome};
use crate::storage::Database;
use crate::transport::{MailClient, NetworkOpener, OutgoingMail, SessionOpener};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let opener: Arc<dyn SessionOpener> = Arc::new(NetworkOpener);

    if cli.check {
        return check_connection(&config, opener).await;
    }

    if let Some(to) = &cli.send_to {
        let mail = OutgoingMail {
            to: to.clone(),
            subject: cli.subject.clone().unwrap_or_default(),
            body: cli.body.clone().unwrap_or_default(),
            in_reply_to: cli.in_reply_to.clone(),
            references: cli
                .references
                .as_deref()
                .map(split_message_ids)
                .unwrap_or_default(),
        };
        return send_one(&config, opener, &mail).await;
    }

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    let db = Arc::new(Database::open(&db_path).await?);
    info!(path = %db_path.display(), "Using SQLite store");

    if let Some(limit) = cli.logs {
        for entry in db.latest_logs(limit).await? {
            println!(
                "{} [{}] {}",
                format_ts(entry.timestamp),
                entry.level.as_str(),
                entry.message
            );
        }
        return Ok(());
    }

    let log = ActivityLog::persistent(db.clone());

    if cli.once {
        let report = poll_once(db.clone(), log, opener, &config).await?;
        let (threads, messages) = db.counts().await?;
        println!(
            "{} ingested, {} duplicates, {} failed; {} threads, {} messages stored",
            report.ingested, report.duplicates, report.failed, threads, messages
        );
        return Ok(());
    }

    let poller = Poller::new(db, log, opener);
    poller.start(config).await;
    info!("Poller running; press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Listening for Ctrl-C failed");
                }
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if poller.status().await == PollerState::Stopped {
                    warn!(reason = ?poller.last_exit().await, "Poller stopped on its own");
                    break;
                }
            }
        }
    }

    if poller.stop().await == StopOutcome::TimedOut {
        warn!("Poller did not finish its cycle before the stop timeout");
    }
    Ok(())
}

async fn check_connection(config: &AppConfig, opener: Arc<dyn SessionOpener>) -> Result<()> {
    let mut client = MailClient::new(config.mail.clone(), config.poller.clone(), opener);
    let result = client.connect().await;
    client.close().await;

    match result {
        Ok(()) => {
            println!("Successfully connected to IMAP and SMTP");
            Ok(())
        }
        Err(e) => bail!("Connection error: {e}"),
    }
}

async fn send_one(
    config: &AppConfig,
    opener: Arc<dyn SessionOpener>,
    mail: &OutgoingMail,
) -> Result<()> {
    let mut client = MailClient::new(config.mail.clone(), config.poller.clone(), opener);
    match client.connect().await {
        Ok(()) => {}
        Err(e @ AppError::Config(_)) => bail!("{e}"),
        Err(e) => warn!(error = %e, "Initial connect failed; sending will retry on its own"),
    }
    let sent = client.send_message(mail).await;
    client.close().await;

    if !sent {
        bail!("could not send mail to {} after retries", mail.to);
    }
    println!("Mail sent to {}", mail.to);
    Ok(())
}

fn format_ts(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}
