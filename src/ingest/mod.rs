//! Turns fetched raw messages into stored, threaded records.
//!
//! Every message is written in its own unit of work: a duplicate is a
//! no-op, a storage failure rolls back only that message, and the batch
//! carries on either way.
use std::sync::Arc;

use anyhow::Result;
use rayon::prelude::*;
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::decode::{decode_message, parse_date, DecodedMessage};
use crate::errors::{AppError, AppResult};
use crate::storage::{Database, UnitOfWork};
use crate::threading::{resolve_thread, Resolution};
use crate::transport::FetchedMessage;
use crate::types::{now_ts, MessageRecord, ThreadRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested {
        message_id: String,
        thread_id: String,
        new_thread: bool,
    },
    Duplicate {
        message_id: String,
    },
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub ingested: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl BatchReport {
    fn tally(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Ingested { .. } => self.ingested += 1,
            IngestOutcome::Duplicate { .. } => self.duplicates += 1,
            IngestOutcome::Failed => self.failed += 1,
        }
    }
}

/// A decoded message with its identifier and date settled.
#[derive(Debug, Clone)]
struct PreparedMessage {
    message_id: String,
    from_name: String,
    from_email: String,
    subject: String,
    body: String,
    date: i64,
    in_reply_to: Option<String>,
    references: Vec<String>,
    folder: String,
    ingested_at: i64,
}

enum Persisted {
    Stored { thread_id: String, new_thread: bool },
    Duplicate,
}

#[derive(Clone)]
pub struct Ingestor {
    db: Arc<Database>,
    log: ActivityLog,
}

impl Ingestor {
    pub fn new(db: Arc<Database>, log: ActivityLog) -> Self {
        Self { db, log }
    }

    /// Decodes the whole batch in parallel, then persists it message by
    /// message in the order given.
    pub async fn ingest_batch(&self, batch: Vec<FetchedMessage>) -> BatchReport {
        let total = batch.len();
        let decoded = tokio::task::spawn_blocking(move || {
            batch
                .into_par_iter()
                .map(|m| {
                    let decoded = decode_message(&m.raw);
                    (m.native_id, m.folder, decoded)
                })
                .collect::<Vec<_>>()
        })
        .await;

        let mut report = BatchReport::default();
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.log
                    .error(format!("Decoding batch of {total} messages panicked: {e}"))
                    .await;
                report.failed = total;
                return report;
            }
        };

        for (native_id, folder, decoded) in decoded {
            let outcome = self.ingest_decoded(&native_id, folder, decoded).await;
            report.tally(&outcome);
        }
        report
    }

    pub async fn ingest_one(&self, fetched: &FetchedMessage) -> IngestOutcome {
        let decoded = decode_message(&fetched.raw);
        self.ingest_decoded(&fetched.native_id, fetched.folder.clone(), decoded)
            .await
    }

    async fn ingest_decoded(
        &self,
        native_id: &str,
        folder: String,
        decoded: AppResult<DecodedMessage>,
    ) -> IngestOutcome {
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.log
                    .error(format!("Error processing email {native_id}: {e}"))
                    .await;
                return IngestOutcome::Failed;
            }
        };

        let prepared = self.prepare(decoded, folder).await;
        let message_id = prepared.message_id.clone();
        let summary = format!(
            "From: {} <{}>\nSubject: {}\nMessage-ID: {}\nIn-Reply-To: {}",
            prepared.from_name,
            prepared.from_email,
            prepared.subject,
            prepared.message_id,
            prepared.in_reply_to.as_deref().unwrap_or("N/A"),
        );

        let result = self
            .db
            .with_isolated_write(move |unit| Box::pin(persist(unit, prepared)))
            .await;

        match result {
            Ok(Persisted::Stored {
                thread_id,
                new_thread,
            }) => {
                self.log
                    .info(format!(
                        "New email processed:\nThread ID: {thread_id}{}\n{summary}",
                        if new_thread { " (new)" } else { "" }
                    ))
                    .await;
                IngestOutcome::Ingested {
                    message_id,
                    thread_id,
                    new_thread,
                }
            }
            Ok(Persisted::Duplicate) => {
                self.log
                    .warning(format!(
                        "Email with message_id {message_id} already exists, skipping"
                    ))
                    .await;
                IngestOutcome::Duplicate { message_id }
            }
            Err(e) => {
                let err = AppError::Persistence(format!("{e:#}"));
                self.log
                    .error(format!("Database error processing email {message_id}: {err}"))
                    .await;
                IngestOutcome::Failed
            }
        }
    }

    /// Settles the identifier and the date; both fall back with a warning
    /// instead of failing.
    async fn prepare(&self, decoded: DecodedMessage, folder: String) -> PreparedMessage {
        let ingested_at = now_ts();

        let message_id = match decoded.message_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => {
                let id = synthesize_message_id();
                self.log
                    .warning(format!(
                        "Generated new message_id for email from {}: {id}",
                        decoded.from_email
                    ))
                    .await;
                id
            }
        };

        let parsed_date = decoded.date_header.as_deref().and_then(parse_date);
        let date = match parsed_date {
            Some(ts) => ts,
            None => {
                self.log
                    .warning(format!(
                        "Invalid date format for email from {}, using current time",
                        decoded.from_email
                    ))
                    .await;
                ingested_at
            }
        };

        PreparedMessage {
            message_id,
            from_name: decoded.from_name,
            from_email: decoded.from_email,
            subject: decoded.subject,
            body: decoded.body,
            date,
            in_reply_to: decoded.in_reply_to,
            references: decoded.references,
            folder,
            ingested_at,
        }
    }
}

async fn persist(unit: &mut UnitOfWork, message: PreparedMessage) -> Result<Persisted> {
    if unit.message_exists(&message.message_id).await? {
        return Ok(Persisted::Duplicate);
    }

    let mut linked: Vec<String> = message.in_reply_to.iter().cloned().collect();
    linked.extend(message.references.iter().cloned());
    let known = unit.thread_ids_for(&linked).await?;

    let resolution = resolve_thread(message.in_reply_to.as_deref(), &message.references, |id| {
        known.get(id).cloned()
    });

    let new_thread = matches!(resolution, Resolution::New(_));
    match &resolution {
        Resolution::New(thread_id) => {
            unit.insert_thread(&ThreadRecord {
                thread_id: thread_id.clone(),
                subject: message.subject.clone(),
                last_updated: message.ingested_at,
            })
            .await?
        }
        Resolution::Existing(thread_id) => {
            unit.touch_thread(thread_id, message.ingested_at).await?
        }
    }

    let thread_id = resolution.thread_id().to_string();
    let record = MessageRecord {
        message_id: message.message_id,
        thread_id: thread_id.clone(),
        from_name: message.from_name,
        from_email: message.from_email,
        subject: message.subject,
        body: message.body,
        date: message.date,
        in_reply_to: message.in_reply_to,
        references: message.references,
        folder: message.folder,
        ingested_at: message.ingested_at,
    };

    if !unit.insert_message(&record).await? {
        anyhow::bail!("message {} was stored by another writer", record.message_id);
    }

    Ok(Persisted::Stored {
        thread_id,
        new_thread,
    })
}

/// Fresh identifier for a message that arrived without one.
pub fn synthesize_message_id() -> String {
    format!("<{}@generated>", Uuid::new_v4())
}
