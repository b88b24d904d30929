//! SQLite-Backed Queue
//!
//! One row per buffered reading, keyed by its sequence number. Each
//! mutation is a single statement or transaction, so removing the head of
//! a large backlog deletes one row instead of rewriting the queue. The next
//! sequence number is kept in a meta row so it survives an emptied queue.

use crate::queue::{lock_error, EnqueueOutcome, OfflineQueue, OverflowPolicy, QueueItem};
use crate::QueueError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS offline_queue (
    seq            INTEGER PRIMARY KEY,
    reading        BLOB    NOT NULL,
    enqueued_at    TEXT    NOT NULL,
    attempt_count  INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS queue_meta (
    key    TEXT    PRIMARY KEY,
    value  INTEGER NOT NULL
);
INSERT OR IGNORE INTO queue_meta (key, value) VALUES ('next_seq', 0);
";

const SELECT_HEAD: &str =
    "SELECT seq, reading, enqueued_at, attempt_count FROM offline_queue ORDER BY seq LIMIT 1";

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::Io(err.to_string())
    }
}

fn count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, Vec<u8>, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_item(
    (seq, reading, enqueued_at, attempt_count): (i64, Vec<u8>, String, i64),
) -> Result<QueueItem, QueueError> {
    let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
        .map_err(|e| QueueError::Corrupt(format!("seq {}: {}", seq, e)))?
        .with_timezone(&Utc);
    Ok(QueueItem {
        seq: seq as u64,
        reading,
        enqueued_at,
        attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
    })
}

fn head(tx: &Transaction<'_>) -> Result<Option<QueueItem>, QueueError> {
    tx.query_row(SELECT_HEAD, [], item_from_row)
        .optional()?
        .map(decode_item)
        .transpose()
}

/// Offline queue persisted to a SQLite database
pub struct SqliteQueue {
    path: PathBuf,
    conn: Mutex<Connection>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path`
    pub fn open(
        path: impl AsRef<Path>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA_SQL)?;

        let capacity = capacity.max(1);
        let len = count(&conn)?;
        if len as usize > capacity {
            warn!(
                "Queue {} holds {} items, above capacity {}",
                path.display(),
                len,
                capacity
            );
        }
        info!(
            "Opened offline queue {} ({} items, capacity {}, {:?})",
            path.display(),
            len,
            capacity,
            policy
        );

        Ok(Self {
            path,
            conn: Mutex::new(conn),
            capacity,
            policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` in a transaction that commits only when it succeeds
    fn transact<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut conn = self.conn.lock().map_err(lock_error)?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

impl OfflineQueue for SqliteQueue {
    fn enqueue(&self, reading: Vec<u8>) -> Result<EnqueueOutcome, QueueError> {
        let (capacity, policy) = (self.capacity, self.policy);
        self.transact(|tx| {
            let mut evicted = None;
            if count(tx)? as usize >= capacity {
                match policy {
                    OverflowPolicy::RejectNewest => {
                        error!("Offline queue full ({} items), rejecting new reading", capacity);
                        return Err(QueueError::Full { capacity });
                    }
                    OverflowPolicy::DropOldest => {
                        evicted = head(tx)?;
                        if let Some(item) = &evicted {
                            tx.execute(
                                "DELETE FROM offline_queue WHERE seq = ?1",
                                params![item.seq as i64],
                            )?;
                            error!(
                                "Offline queue full ({} items), dropped oldest seq {}",
                                capacity, item.seq
                            );
                        }
                    }
                }
            }

            let seq: i64 = tx.query_row(
                "SELECT value FROM queue_meta WHERE key = 'next_seq'",
                [],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO offline_queue (seq, reading, enqueued_at, attempt_count) \
                 VALUES (?1, ?2, ?3, 0)",
                params![seq, reading, Utc::now().to_rfc3339()],
            )?;
            tx.execute(
                "UPDATE queue_meta SET value = ?1 WHERE key = 'next_seq'",
                params![seq + 1],
            )?;
            debug!("Enqueued seq {}", seq);

            let seq = seq as u64;
            Ok(match evicted {
                Some(evicted) => EnqueueOutcome::Evicted { seq, evicted },
                None => EnqueueOutcome::Accepted { seq },
            })
        })
    }

    fn peek_oldest(&self) -> Result<Option<QueueItem>, QueueError> {
        self.transact(head)
    }

    fn remove_oldest(&self) -> Result<Option<QueueItem>, QueueError> {
        self.transact(|tx| {
            let item = head(tx)?;
            if let Some(item) = &item {
                tx.execute("DELETE FROM offline_queue WHERE seq = ?1", params![item.seq as i64])?;
            }
            Ok(item)
        })
    }

    fn len(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock().map_err(lock_error)?;
        Ok(count(&conn)? as usize)
    }

    fn record_attempt(&self) -> Result<Option<u32>, QueueError> {
        self.transact(|tx| {
            let Some(item) = head(tx)? else {
                return Ok(None);
            };
            let attempts = item.attempt_count.saturating_add(1);
            tx.execute(
                "UPDATE offline_queue SET attempt_count = ?1 WHERE seq = ?2",
                params![attempts, item.seq as i64],
            )?;
            Ok(Some(attempts))
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
