//! Durable FIFO of pending records.
//!
//! A single `queue-writer` thread owns the SQLite connection and serves commands from an
//! unbounded channel, so appends, drains and deletes are serialized without a lock. Ids come
//! from `AUTOINCREMENT` and are therefore never reused, even after the rows they named are gone.

use crate::record::Record;
use crate::stats::StatusCounters;
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: i64,
    pub payload: String,
}

/// Result of [`QueueHandle::drain_oldest`]. `count` spans the id range from `first_id` through
/// the last drained id, which is exactly what [`QueueHandle::delete_range`] needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drained {
    pub entries: Vec<QueueEntry>,
    pub first_id: i64,
    pub count: u64,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug)]
pub enum QueueCommand {
    Append {
        payload: String,
        respond_to: oneshot::Sender<Result<i64>>,
    },
    DrainOldest {
        max: usize,
        respond_to: oneshot::Sender<Result<Drained>>,
    },
    DeleteRange {
        first_id: i64,
        count: u64,
        respond_to: oneshot::Sender<Result<u64>>,
    },
    Count {
        respond_to: oneshot::Sender<Result<u64>>,
    },
}

#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueHandle {
    pub fn open(
        path: &Path,
        max_entries: Option<u64>,
        stats: Arc<StatusCounters>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open queue database {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("enable WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")
            .context("set synchronous")?;
        Self::spawn(conn, max_entries, stats)
    }

    pub fn open_in_memory(stats: Arc<StatusCounters>) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory queue")?;
        Self::spawn(conn, None, stats)
    }

    fn spawn(conn: Connection, max_entries: Option<u64>, stats: Arc<StatusCounters>) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("create queue schema")?;
        let depth: i64 = conn
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))
            .context("count queue")?;
        let depth = depth.max(0) as u64;
        stats.set_queue_depth(depth);
        tracing::info!(depth, "durable queue opened");

        let mut runtime = QueueRuntime {
            conn,
            depth,
            max_entries,
            stats,
        };
        runtime.enforce_cap()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<QueueCommand>();
        std::thread::Builder::new()
            .name("queue-writer".to_string())
            .spawn(move || runtime.run(&mut rx))
            .context("failed to spawn queue thread")?;

        Ok(Self { tx })
    }

    pub async fn append(&self, record: &Record) -> Result<i64> {
        self.append_raw(record.to_json()?).await
    }

    pub async fn append_raw(&self, payload: String) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Append {
            payload,
            respond_to: tx,
        })?;
        rx.await.context("queue thread dropped response")?
    }

    /// Up to `max` oldest entries in ascending id order; empty, not an error, when idle.
    pub async fn drain_oldest(&self, max: usize) -> Result<Drained> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::DrainOldest {
            max,
            respond_to: tx,
        })?;
        rx.await.context("queue thread dropped response")?
    }

    /// Deletes ids in `[first_id, first_id + count)`. Absent ids are ignored.
    pub async fn delete_range(&self, first_id: i64, count: u64) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::DeleteRange {
            first_id,
            count,
            respond_to: tx,
        })?;
        rx.await.context("queue thread dropped response")?
    }

    pub async fn count(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Count { respond_to: tx })?;
        rx.await.context("queue thread dropped response")?
    }

    fn send(&self, cmd: QueueCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow!("queue thread stopped"))
    }
}

struct QueueRuntime {
    conn: Connection,
    depth: u64,
    max_entries: Option<u64>,
    stats: Arc<StatusCounters>,
}

impl QueueRuntime {
    fn run(mut self, rx: &mut mpsc::UnboundedReceiver<QueueCommand>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                QueueCommand::Append {
                    payload,
                    respond_to,
                } => {
                    let res = self.append(&payload);
                    if let Err(err) = &res {
                        tracing::warn!(error=%err, "queue append failed");
                    }
                    let _ = respond_to.send(res);
                }
                QueueCommand::DrainOldest { max, respond_to } => {
                    let _ = respond_to.send(self.drain_oldest(max));
                }
                QueueCommand::DeleteRange {
                    first_id,
                    count,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.delete_range(first_id, count));
                }
                QueueCommand::Count { respond_to } => {
                    let _ = respond_to.send(self.count());
                }
            }
        }
        tracing::debug!("queue thread exiting");
    }

    fn append(&mut self, payload: &str) -> Result<i64> {
        self.conn
            .prepare_cached("INSERT INTO queue (payload) VALUES (?1)")?
            .execute(params![payload])
            .context("insert queue entry")?;
        let id = self.conn.last_insert_rowid();
        self.depth = self.depth.saturating_add(1);
        if let Err(err) = self.enforce_cap() {
            tracing::warn!(error=%err, "failed to enforce queue cap");
        }
        self.stats.set_queue_depth(self.depth);
        tracing::trace!(id, depth = self.depth, "queued record");
        Ok(id)
    }

    fn drain_oldest(&mut self, max: usize) -> Result<Drained> {
        if max == 0 {
            return Ok(Drained::default());
        }
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, payload FROM queue ORDER BY id ASC LIMIT ?1")?;
        let rows = stmt.query_map(params![max as i64], |row| {
            Ok(QueueEntry {
                id: row.get(0)?,
                payload: row.get(1)?,
            })
        })?;
        let entries = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read queue entries")?;

        let (first_id, count) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.id, (last.id - first.id + 1).max(0) as u64),
            _ => (0, 0),
        };
        Ok(Drained {
            entries,
            first_id,
            count,
        })
    }

    fn delete_range(&mut self, first_id: i64, count: u64) -> Result<u64> {
        if count == 0 {
            return Ok(0);
        }
        let end = first_id.saturating_add(i64::try_from(count).unwrap_or(i64::MAX));
        let deleted = self
            .conn
            .prepare_cached("DELETE FROM queue WHERE id >= ?1 AND id < ?2")?
            .execute(params![first_id, end])
            .context("delete queue range")? as u64;
        self.depth = self.depth.saturating_sub(deleted);
        self.stats.set_queue_depth(self.depth);
        tracing::debug!(first_id, count, deleted, depth = self.depth, "deleted queue range");
        Ok(deleted)
    }

    fn count(&mut self) -> Result<u64> {
        let depth: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))
            .context("count queue")?;
        self.depth = depth.max(0) as u64;
        self.stats.set_queue_depth(self.depth);
        Ok(self.depth)
    }

    /// Over the cap, the oldest rows go first and are counted as dropped.
    fn enforce_cap(&mut self) -> Result<()> {
        let Some(max) = self.max_entries else {
            return Ok(());
        };
        if self.depth <= max {
            return Ok(());
        }
        let excess = self.depth - max;
        let dropped = self
            .conn
            .execute(
                "DELETE FROM queue WHERE id IN (SELECT id FROM queue ORDER BY id ASC LIMIT ?1)",
                params![excess as i64],
            )
            .context("drop oldest queue entries")? as u64;
        self.depth = self.depth.saturating_sub(dropped);
        self.stats.record_dropped(dropped);
        self.stats.set_queue_depth(self.depth);
        tracing::warn!(dropped, max, "queue cap reached; dropped oldest entries");
        Ok(())
    }
}
