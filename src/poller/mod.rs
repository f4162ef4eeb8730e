//! Background poller: connect, fetch, ingest, sleep, repeat.
//!
//! One loop at a time. `start`, `stop` and `status` all go through the
//! same lock, and the loop itself owns its transport; the only thing shared
//! with it is the stop signal.
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::activity::ActivityLog;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::ingest::{BatchReport, Ingestor};
use crate::storage::Database;
use crate::transport::{MailClient, SessionOpener};
use crate::types::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
    /// The loop was signalled but is still finishing an in-flight cycle.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopRequested,
    RetriesExhausted,
}

struct Control {
    state: PollerState,
    stop_tx: Option<watch::Sender<bool>>,
    live_rx: Option<watch::Receiver<bool>>,
    task: Option<JoinHandle<ExitReason>>,
    stop_timeout: Duration,
    last_exit: Option<ExitReason>,
}

impl Control {
    /// Folds a loop that ended by itself back into `Stopped`.
    fn reap(&mut self) {
        let finished = self.task.as_ref().is_some_and(|t| t.is_finished());
        if !finished {
            return;
        }
        if let Some(task) = self.task.take() {
            match task.now_or_never() {
                Some(Ok(reason)) => self.last_exit = Some(reason),
                Some(Err(e)) => warn!(error = %e, "Poller task ended abnormally"),
                None => {}
            }
        }
        self.stop_tx = None;
        self.live_rx = None;
        self.state = PollerState::Stopped;
    }

    /// Reaps a finished loop, and moves `Starting` to `Running` once the
    /// loop has reported in.
    fn refresh(&mut self) {
        self.reap();
        let live = self.live_rx.as_ref().is_some_and(|rx| *rx.borrow());
        if self.state == PollerState::Starting && live {
            self.state = PollerState::Running;
        }
    }
}

pub struct Poller {
    db: Arc<Database>,
    log: ActivityLog,
    opener: Arc<dyn SessionOpener>,
    control: Mutex<Control>,
}

impl Poller {
    pub fn new(db: Arc<Database>, log: ActivityLog, opener: Arc<dyn SessionOpener>) -> Self {
        Self {
            db,
            log,
            opener,
            control: Mutex::new(Control {
                state: PollerState::Stopped,
                stop_tx: None,
                live_rx: None,
                task: None,
                stop_timeout: Duration::from_secs(5),
                last_exit: None,
            }),
        }
    }

    /// Spawns the loop with `config`. A second call while a loop is alive
    /// is a no-op reported as `AlreadyRunning`.
    pub async fn start(&self, config: AppConfig) -> StartOutcome {
        let mut control = self.control.lock().await;
        control.refresh();
        if control.state != PollerState::Stopped || control.task.is_some() {
            self.log.info("Poller is already running").await;
            return StartOutcome::AlreadyRunning;
        }

        control.state = PollerState::Starting;
        control.stop_timeout = config.poller.stop_timeout;
        control.last_exit = None;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (live_tx, live_rx) = watch::channel(false);
        let worker = PollLoop {
            db: self.db.clone(),
            log: self.log.clone(),
            ingestor: Ingestor::new(self.db.clone(), self.log.clone()),
            opener: self.opener.clone(),
            config,
            stop: stop_rx,
            live: live_tx,
        };

        control.task = Some(tokio::spawn(worker.run()));
        control.stop_tx = Some(stop_tx);
        control.live_rx = Some(live_rx);
        StartOutcome::Started
    }

    /// Signals the loop and waits, up to the configured stop timeout, for
    /// it to close its transport and exit.
    pub async fn stop(&self) -> StopOutcome {
        let mut control = self.control.lock().await;
        control.refresh();
        if control.state == PollerState::Stopped && control.task.is_none() {
            return StopOutcome::NotRunning;
        }

        if let Some(stop_tx) = control.stop_tx.take() {
            let _ = stop_tx.send(true);
        }

        let Some(mut task) = control.task.take() else {
            control.live_rx = None;
            control.state = PollerState::Stopped;
            return StopOutcome::Stopped;
        };

        match tokio::time::timeout(control.stop_timeout, &mut task).await {
            Ok(joined) => {
                match joined {
                    Ok(reason) => control.last_exit = Some(reason),
                    Err(e) => warn!(error = %e, "Poller task ended abnormally"),
                }
                control.live_rx = None;
                control.state = PollerState::Stopped;
                StopOutcome::Stopped
            }
            Err(_) => {
                warn!("Poller still busy after stop timeout; it will exit after its current cycle");
                control.task = Some(task);
                StopOutcome::TimedOut
            }
        }
    }

    pub async fn status(&self) -> PollerState {
        let mut control = self.control.lock().await;
        control.refresh();
        control.state
    }

    pub async fn last_exit(&self) -> Option<ExitReason> {
        let mut control = self.control.lock().await;
        control.refresh();
        control.last_exit
    }

    /// Newest first.
    pub fn latest_logs(&self, limit: usize) -> Vec<LogEntry> {
        self.log.latest(limit)
    }
}

struct PollLoop {
    db: Arc<Database>,
    log: ActivityLog,
    ingestor: Ingestor,
    opener: Arc<dyn SessionOpener>,
    config: AppConfig,
    stop: watch::Receiver<bool>,
    live: watch::Sender<bool>,
}

impl PollLoop {
    async fn run(mut self) -> ExitReason {
        let _ = self.live.send(true);
        self.log.info("Poller started").await;

        let max_retries = self.config.poller.max_connect_retries.max(1);
        let mut transport: Option<MailClient> = None;
        let mut retries = 0u32;

        let reason = loop {
            if self.stop_requested() {
                break ExitReason::StopRequested;
            }

            if transport.is_none() {
                let mut client = MailClient::new(
                    self.config.mail.clone(),
                    self.config.poller.clone(),
                    self.opener.clone(),
                );
                match client.connect().await {
                    Ok(()) => {
                        retries = 0;
                        restore_cursors(&self.db, &mut client).await;
                        self.log
                            .success("Connection established with email server")
                            .await;
                        transport = Some(client);
                    }
                    Err(e) => {
                        client.close().await;
                        retries += 1;
                        self.log
                            .error(format!("Connection error (attempt {retries}): {e}"))
                            .await;
                        if retries >= max_retries {
                            self.log
                                .error("Maximum connection attempts reached; poller stopping")
                                .await;
                            break ExitReason::RetriesExhausted;
                        }
                        if self.pause().await {
                            break ExitReason::StopRequested;
                        }
                        continue;
                    }
                }
            }

            if let Some(client) = transport.as_mut() {
                match client.fetch_messages().await {
                    Ok(batch) if batch.is_empty() => {
                        save_cursors(&self.db, client).await;
                        self.log.info("No new emails to process").await;
                    }
                    Ok(batch) => {
                        self.log
                            .info(format!("Retrieved {} emails", batch.len()))
                            .await;
                        let report = self.ingestor.ingest_batch(batch).await;
                        save_cursors(&self.db, client).await;
                        self.report(report).await;
                    }
                    Err(e) => {
                        self.log
                            .error(format!("Error fetching/processing emails: {e}"))
                            .await;
                        client.close().await;
                        transport = None;
                        self.log.warning("Connection closed due to error").await;
                    }
                }
            }

            if self.pause().await {
                break ExitReason::StopRequested;
            }
        };

        if let Some(mut client) = transport.take() {
            client.close().await;
            self.log.info("Connection closed successfully").await;
        }
        self.log.info("Poller stopped").await;
        reason
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleeps one poll interval; returns early, with `true`, on a stop
    /// request.
    async fn pause(&mut self) -> bool {
        if self.stop_requested() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.poller.poll_interval) => self.stop_requested(),
            changed = self.stop.changed() => changed.is_err() || self.stop_requested(),
        }
    }

    async fn report(&self, report: BatchReport) {
        let totals = match self.db.counts().await {
            Ok((threads, messages)) => {
                format!("; store holds {threads} threads, {messages} messages")
            }
            Err(e) => {
                warn!(error = %e, "Counting stored records failed");
                String::new()
            }
        };
        self.log
            .info(format!(
                "Batch done: {} ingested, {} duplicates, {} failed{totals}",
                report.ingested, report.duplicates, report.failed
            ))
            .await;
    }
}

/// One connect / fetch / ingest / close cycle outside the background loop.
pub async fn poll_once(
    db: Arc<Database>,
    log: ActivityLog,
    opener: Arc<dyn SessionOpener>,
    config: &AppConfig,
) -> AppResult<BatchReport> {
    let mut client = MailClient::new(config.mail.clone(), config.poller.clone(), opener);
    if let Err(e) = client.connect().await {
        client.close().await;
        return Err(e);
    }
    restore_cursors(&db, &mut client).await;

    let fetched = client.fetch_messages().await;
    let report = match fetched {
        Ok(batch) => {
            log.info(format!("Retrieved {} emails", batch.len())).await;
            let report = Ingestor::new(db.clone(), log).ingest_batch(batch).await;
            save_cursors(&db, &client).await;
            Ok(report)
        }
        Err(e) => Err(e),
    };
    client.close().await;
    report
}

async fn restore_cursors(db: &Database, client: &mut MailClient) {
    match db.load_cursors().await {
        Ok(cursors) => client.restore_cursors(cursors),
        Err(e) => warn!(error = %e, "Loading folder cursors failed; reading folders afresh"),
    }
}

/// Cursors are saved only after the batch went through the pipeline.
async fn save_cursors(db: &Database, client: &MailClient) {
    if let Err(e) = db.save_cursors(client.cursors()).await {
        warn!(error = %e, "Saving folder cursors failed");
    }
}
