use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use speckle_types::{Fragment, ObjectId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{TransportError, TransportResult};
use crate::traits::ObjectStore;

const BACKEND: &str = "sqlite";

/// Maximum number of bound parameters used in one `IN (...)` query.
const QUERY_CHUNK: usize = 500;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS objects (
    hash TEXT PRIMARY KEY,
    content TEXT
) WITHOUT ROWID;";

/// Settings for the SQLite tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Pending writes that force a transaction without waiting for the timer.
    pub max_batch_size: usize,
    /// Idle time after the last accepted write before pending writes commit.
    pub flush_interval_ms: u64,
    /// Capacity of the queue between callers and the writer task.
    pub queue_capacity: usize,
    /// How long a connection waits on a locked database.
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            flush_interval_ms: 100,
            queue_capacity: 64,
            busy_timeout_ms: 5000,
        }
    }
}

impl SqliteConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

enum Command {
    Put(Vec<Fragment>),
    Flush(oneshot::Sender<TransportResult<()>>),
}

/// Fragment store in a single write-ahead-logged SQLite file with one table
/// `objects(hash, content)`.
///
/// Writes are handed to a background task that coalesces them into one
/// transaction per batch. A batch commits when it reaches
/// [`SqliteConfig::max_batch_size`], when no new write arrived for
/// [`SqliteConfig::flush_interval_ms`], or on [`flush`](ObjectStore::flush).
/// Only committed writes are visible to readers, which use their own
/// connection so they never wait on the writer.
///
/// Must be opened inside a Tokio runtime.
pub struct SqliteStore {
    path: PathBuf,
    reader: Arc<Mutex<Connection>>,
    commands: mpsc::Sender<Command>,
    failure: Arc<Mutex<Option<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl Into<PathBuf>, config: SqliteConfig) -> TransportResult<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| TransportError::io(BACKEND, e))?;
        }

        let writer_conn = Self::connect(&path, &config)?;
        writer_conn.execute_batch(SCHEMA).map_err(db_err)?;
        let reader = Self::connect(&path, &config)?;

        let (commands, rx) = mpsc::channel(config.queue_capacity.max(1));
        let failure = Arc::new(Mutex::new(None));
        let writer = tokio::spawn(write_loop(
            Arc::new(Mutex::new(writer_conn)),
            rx,
            config.clone(),
            failure.clone(),
        ));

        info!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            path,
            reader: Arc::new(Mutex::new(reader)),
            commands,
            failure,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// The conventional database location for an application scope:
    /// `<user data dir>/Speckle/<scope>.db`.
    pub fn default_path(scope: &str) -> TransportResult<PathBuf> {
        let base = dirs::data_dir().ok_or_else(|| {
            TransportError::io(
                BACKEND,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no user data directory"),
            )
        })?;
        Ok(base.join("Speckle").join(format!("{scope}.db")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of committed fragments.
    pub async fn len(&self) -> TransportResult<usize> {
        self.read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as usize)
        })
        .await
    }

    pub async fn is_empty(&self) -> TransportResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Commit pending writes and stop the writer task.
    pub async fn close(&self) -> TransportResult<()> {
        self.flush().await?;
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        Ok(())
    }

    fn connect(path: &Path, config: &SqliteConfig) -> TransportResult<Connection> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(db_err)?;
        conn.busy_timeout(config.busy_timeout()).map_err(db_err)?;
        Ok(conn)
    }

    fn check_writer(&self) -> TransportResult<()> {
        match self.failure.lock().as_ref() {
            Some(reason) => Err(TransportError::database(BACKEND, format!("writer failed: {reason}"))),
            None => Ok(()),
        }
    }

    fn closed() -> TransportError {
        TransportError::Closed {
            backend: BACKEND.to_string(),
        }
    }

    async fn read<T, F>(&self, f: F) -> TransportResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || {
            let conn = reader.lock();
            f(&conn)
        })
        .await
        .map_err(|e| TransportError::database(BACKEND, e))?
        .map_err(db_err)
    }
}

fn db_err(e: rusqlite::Error) -> TransportError {
    TransportError::database(BACKEND, e)
}

async fn write_loop(
    conn: Arc<Mutex<Connection>>,
    mut rx: mpsc::Receiver<Command>,
    config: SqliteConfig,
    failure: Arc<Mutex<Option<String>>>,
) {
    let mut pending: Vec<Fragment> = Vec::new();
    loop {
        let command = if pending.is_empty() {
            rx.recv().await
        } else {
            match tokio::time::timeout(config.flush_interval(), rx.recv()).await {
                Ok(command) => command,
                Err(_) => {
                    commit(&conn, &mut pending, &failure).await;
                    continue;
                }
            }
        };

        match command {
            Some(Command::Put(batch)) => {
                pending.extend(batch);
                if pending.len() >= config.max_batch_size {
                    commit(&conn, &mut pending, &failure).await;
                }
            }
            Some(Command::Flush(reply)) => {
                let result = commit(&conn, &mut pending, &failure).await;
                let _ = reply.send(result);
            }
            None => {
                commit(&conn, &mut pending, &failure).await;
                debug!("sqlite writer stopped");
                return;
            }
        }
    }
}

async fn commit(
    conn: &Arc<Mutex<Connection>>,
    pending: &mut Vec<Fragment>,
    failure: &Arc<Mutex<Option<String>>>,
) -> TransportResult<()> {
    if let Some(reason) = failure.lock().as_ref() {
        pending.clear();
        return Err(TransportError::database(BACKEND, format!("writer failed: {reason}")));
    }
    if pending.is_empty() {
        return Ok(());
    }

    let batch = std::mem::take(pending);
    let count = batch.len();
    let conn = conn.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached("INSERT OR IGNORE INTO objects (hash, content) VALUES (?1, ?2)")?;
            for fragment in &batch {
                stmt.execute((fragment.id.to_hex(), &fragment.json))?;
            }
        }
        tx.commit()
    })
    .await;

    let outcome = match result {
        Ok(Ok(())) => {
            debug!(count, "committed sqlite batch");
            Ok(())
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    outcome.map_err(|reason| {
        error!(%reason, count, "sqlite batch failed");
        *failure.lock() = Some(reason.clone());
        TransportError::database(BACKEND, reason)
    })
}

#[async_trait]
impl ObjectStore for SqliteStore {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn get(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let key = id.to_hex();
        self.read(move |conn| {
            conn.query_row("SELECT content FROM objects WHERE hash = ?1", [key], |row| row.get(0))
                .optional()
        })
        .await
    }

    async fn put_batch(&self, fragments: &[Fragment]) -> TransportResult<()> {
        self.check_writer()?;
        if fragments.is_empty() {
            return Ok(());
        }
        self.commands
            .send(Command::Put(fragments.to_vec()))
            .await
            .map_err(|_| Self::closed())
    }

    async fn get_batch(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, String>> {
        let keys: Vec<String> = ids.iter().map(ObjectId::to_hex).collect();
        let rows = self
            .read(move |conn| {
                let mut rows = Vec::with_capacity(keys.len());
                for chunk in keys.chunks(QUERY_CHUNK) {
                    let sql = format!(
                        "SELECT hash, content FROM objects WHERE hash IN ({})",
                        placeholders(chunk.len())
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let found = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?;
                    for row in found {
                        rows.push(row?);
                    }
                }
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(hash, content)| {
                ObjectId::from_hex(&hash)
                    .map(|id| (id, content))
                    .map_err(|e| TransportError::corrupt(BACKEND, &hash, e.to_string()))
            })
            .collect()
    }

    async fn has_batch(&self, ids: &[ObjectId]) -> TransportResult<HashSet<ObjectId>> {
        let keys: Vec<String> = ids.iter().map(ObjectId::to_hex).collect();
        let hashes = self
            .read(move |conn| {
                let mut hashes = Vec::new();
                for chunk in keys.chunks(QUERY_CHUNK) {
                    let sql = format!("SELECT hash FROM objects WHERE hash IN ({})", placeholders(chunk.len()));
                    let mut stmt = conn.prepare(&sql)?;
                    let found = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
                    for hash in found {
                        hashes.push(hash?);
                    }
                }
                Ok(hashes)
            })
            .await?;

        hashes
            .into_iter()
            .map(|hash| ObjectId::from_hex(&hash).map_err(|e| TransportError::corrupt(BACKEND, &hash, e.to_string())))
            .collect()
    }

    async fn flush(&self) -> TransportResult<()> {
        self.check_writer()?;
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Flush(reply))
            .await
            .map_err(|_| Self::closed())?;
        done.await.map_err(|_| Self::closed())?
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

fn placeholders(n: usize) -> String {
    let mut sql = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            sql.push(',');
        }
        sql.push('?');
    }
    sql
}
