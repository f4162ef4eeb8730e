use crate::types::{FolderCursor, LogEntry, LogLevel, MessageRecord, ThreadRecord};
use anyhow::{Context, Result};
use dirs::home_dir;
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

pub const DB_FILE_NAME: &str = "mailweave.db";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Database {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("parsing sqlite url {url}"))?
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Database {
            pool,
            path: Some(db_path.to_path_buf()),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// Private store on a single connection; every pool checkout sees the
    /// same memory database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory sqlite url")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory sqlite")?;

        let db = Database { pool, path: None };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                last_updated INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_threads_last_updated ON threads(last_updated DESC);

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                from_name TEXT NOT NULL,
                from_email TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                date INTEGER NOT NULL,
                in_reply_to TEXT,
                references_json TEXT NOT NULL DEFAULT '[]',
                folder TEXT NOT NULL DEFAULT 'INBOX',
                ingested_at INTEGER NOT NULL,
                FOREIGN KEY (thread_id) REFERENCES threads(thread_id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, date);

            CREATE TABLE IF NOT EXISTS folder_cursors (
                folder TEXT PRIMARY KEY,
                uid_validity INTEGER NOT NULL,
                highest_uid INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running migrations")?;

        Ok(())
    }

    /// Runs `work` inside its own transaction: committed when it returns
    /// `Ok`, rolled back when it returns `Err`. Nothing else shares the
    /// transaction, so one failing unit never undoes another.
    pub async fn with_isolated_write<T, F>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'u> FnOnce(&'u mut UnitOfWork) -> BoxFuture<'u, Result<T>>,
    {
        let tx = self.pool.begin().await.context("beginning unit of work")?;
        let mut unit = UnitOfWork { tx };

        match work(&mut unit).await {
            Ok(value) => {
                unit.tx.commit().await.context("committing unit of work")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = unit.tx.rollback().await {
                    warn!(error = %rollback, "Rolling back unit of work failed");
                }
                Err(e)
            }
        }
    }

    pub async fn load_message(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            r#"
            SELECT message_id, thread_id, from_name, from_email, subject, body, date,
                   in_reply_to, references_json, folder, ingested_at
            FROM messages
            WHERE message_id = ?1;
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading message")?;

        Ok(row.map(|row| message_from_row(&row)))
    }

    pub async fn load_thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>> {
        let row = sqlx::query(
            "SELECT thread_id, subject, last_updated FROM threads WHERE thread_id = ?1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading thread")?;

        Ok(row.map(|row| ThreadRecord {
            thread_id: row.get(0),
            subject: row.get(1),
            last_updated: row.get(2),
        }))
    }

    /// Most recently active threads first.
    pub async fn list_threads(&self, limit: usize) -> Result<Vec<ThreadRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT thread_id, subject, last_updated
            FROM threads
            ORDER BY last_updated DESC, thread_id ASC
            LIMIT ?1;
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("listing threads")?;

        Ok(rows
            .into_iter()
            .map(|row| ThreadRecord {
                thread_id: row.get(0),
                subject: row.get(1),
                last_updated: row.get(2),
            })
            .collect())
    }

    /// Messages of one thread, oldest first.
    pub async fn messages_in_thread(&self, thread_id: &str) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, thread_id, from_name, from_email, subject, body, date,
                   in_reply_to, references_json, folder, ingested_at
            FROM messages
            WHERE thread_id = ?1
            ORDER BY date ASC, ingested_at ASC;
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .context("loading thread messages")?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    /// (threads, messages)
    pub async fn counts(&self) -> Result<(i64, i64)> {
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM threads), (SELECT COUNT(*) FROM messages)",
        )
        .fetch_one(&self.pool)
        .await
        .context("counting threads and messages")?;
        Ok((row.get::<i64, _>(0), row.get::<i64, _>(1)))
    }

    pub async fn load_cursors(&self) -> Result<HashMap<String, FolderCursor>> {
        let rows = sqlx::query("SELECT folder, uid_validity, highest_uid FROM folder_cursors")
            .fetch_all(&self.pool)
            .await
            .context("loading folder cursors")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let cursor = FolderCursor {
                    uid_validity: row.get::<i64, _>(1) as u32,
                    highest_uid: row.get::<i64, _>(2) as u32,
                };
                (row.get::<String, _>(0), cursor)
            })
            .collect())
    }

    pub async fn save_cursors(&self, cursors: &HashMap<String, FolderCursor>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning cursor update")?;
        for (folder, cursor) in cursors {
            sqlx::query(
                r#"
                INSERT INTO folder_cursors (folder, uid_validity, highest_uid)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(folder) DO UPDATE SET
                    uid_validity = excluded.uid_validity,
                    highest_uid = excluded.highest_uid;
                "#,
            )
            .bind(folder)
            .bind(i64::from(cursor.uid_validity))
            .bind(i64::from(cursor.highest_uid))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("saving cursor for folder {folder}"))?;
        }
        tx.commit().await.context("committing cursor update")?;
        Ok(())
    }

    pub async fn insert_log(&self, entry: &LogEntry) -> Result<()> {
        sqlx::query("INSERT INTO activity_log (timestamp, level, message) VALUES (?1, ?2, ?3)")
            .bind(entry.timestamp)
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .execute(&self.pool)
            .await
            .context("inserting activity log entry")?;
        Ok(())
    }

    /// Newest first.
    pub async fn latest_logs(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, level, message
            FROM activity_log
            ORDER BY timestamp DESC, id DESC
            LIMIT ?1;
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading latest activity log entries")?;

        Ok(rows
            .into_iter()
            .map(|row| LogEntry {
                timestamp: row.get(0),
                level: LogLevel::from_str_lossy(&row.get::<String, _>(1)),
                message: row.get(2),
            })
            .collect())
    }
}

/// The writes of one ingested message. Obtained only through
/// [`Database::with_isolated_write`].
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

impl UnitOfWork {
    pub async fn message_exists(&mut self, message_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM messages WHERE message_id = ?1")
            .bind(message_id)
            .fetch_optional(&mut *self.tx)
            .await
            .context("checking for existing message")?;
        Ok(row.is_some())
    }

    /// Thread ids of whichever of `message_ids` are already stored.
    pub async fn thread_ids_for(
        &mut self,
        message_ids: &[String],
    ) -> Result<HashMap<String, String>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT message_id, thread_id FROM messages WHERE message_id IN (");
        {
            let mut separated = qb.separated(", ");
            for id in message_ids {
                separated.push_bind(id);
            }
        }
        qb.push(")");

        let rows = qb
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .context("looking up threads of referenced messages")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
            .collect())
    }

    pub async fn insert_thread(&mut self, thread: &ThreadRecord) -> Result<()> {
        sqlx::query("INSERT INTO threads (thread_id, subject, last_updated) VALUES (?1, ?2, ?3)")
            .bind(&thread.thread_id)
            .bind(&thread.subject)
            .bind(thread.last_updated)
            .execute(&mut *self.tx)
            .await
            .context("inserting thread")?;
        Ok(())
    }

    pub async fn touch_thread(&mut self, thread_id: &str, last_updated: i64) -> Result<()> {
        sqlx::query("UPDATE threads SET last_updated = ?2 WHERE thread_id = ?1")
            .bind(thread_id)
            .bind(last_updated)
            .execute(&mut *self.tx)
            .await
            .context("touching thread")?;
        Ok(())
    }

    /// First write wins: returns `false` when the id was already present.
    pub async fn insert_message(&mut self, message: &MessageRecord) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO messages (
                message_id, thread_id, from_name, from_email, subject, body, date,
                in_reply_to, references_json, folder, ingested_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(message_id) DO NOTHING;
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.thread_id)
        .bind(&message.from_name)
        .bind(&message.from_email)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(message.date)
        .bind(&message.in_reply_to)
        .bind(serde_json::to_string(&message.references).unwrap_or_else(|_| "[]".into()))
        .bind(&message.folder)
        .bind(message.ingested_at)
        .execute(&mut *self.tx)
        .await
        .context("inserting message")?;

        Ok(res.rows_affected() == 1)
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> MessageRecord {
    let references_json: String = row.get(8);
    MessageRecord {
        message_id: row.get(0),
        thread_id: row.get(1),
        from_name: row.get(2),
        from_email: row.get(3),
        subject: row.get(4),
        body: row.get(5),
        date: row.get(6),
        in_reply_to: row.get(7),
        references: serde_json::from_str(&references_json).unwrap_or_default(),
        folder: row.get(9),
        ingested_at: row.get(10),
    }
}

pub(crate) fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("MAILWEAVE_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating MAILWEAVE_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join("mailweave");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        } else {
            warn!(
                "Unable to create {}/mailweave; falling back to workspace-local storage",
                home.display()
            );
        }
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("mailweave-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}
