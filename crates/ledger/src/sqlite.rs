//! SQLite-Backed Ledger Store
//!
//! Entries live in one table keyed by `(subject_id, idx)`. Appends run in an
//! immediate transaction that checks the next index before inserting, so a
//! stale writer gets [`StoreError::IndexConflict`] and a failed write leaves
//! nothing behind. WAL mode lets the read connection serve lookups while a
//! commit is in progress.

use crate::entry::LedgerEntry;
use crate::error::StoreError;
use crate::store::{lock_error, LedgerStore};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS ledger_entries (
    subject_id  TEXT    NOT NULL,
    idx         INTEGER NOT NULL,
    event_type  TEXT    NOT NULL,
    curr_hash   TEXT    NOT NULL,
    entry       TEXT    NOT NULL,
    PRIMARY KEY (subject_id, idx)
) WITHOUT ROWID;
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connection with the pragmas every ledger connection needs
fn open_connection(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
}

fn to_sql_index(index: u64) -> Result<i64, StoreError> {
    i64::try_from(index)
        .map_err(|_| StoreError::Unavailable(format!("index {} out of range", index)))
}

fn decode(subject_id: &str, json: &str) -> Result<LedgerEntry, StoreError> {
    serde_json::from_str(json)
        .map_err(|e| StoreError::Corrupt(format!("entry of {}: {}", subject_id, e)))
}

/// Ledger store persisted to a SQLite database
pub struct SqliteLedgerStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl SqliteLedgerStore {
    /// Open (or create) the ledger database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let writer = open_connection(&path)?;
        writer.execute_batch(SCHEMA_SQL)?;
        let reader = open_connection(&path)?;

        let (entries, subjects): (i64, i64) = reader.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT subject_id) FROM ledger_entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        info!(
            "Opened ledger database {} ({} entries, {} subjects)",
            path.display(),
            entries,
            subjects
        );

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn query_entries(
        &self,
        sql: &str,
        subject_id: &str,
        bind: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.reader.lock().map_err(lock_error)?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(bind, |row| row.get::<_, String>(0))?;
        let mut entries = Vec::new();
        for json in rows {
            entries.push(decode(subject_id, &json?)?);
        }
        Ok(entries)
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn read_entry(&self, subject_id: &str, index: u64) -> Result<Option<LedgerEntry>, StoreError> {
        let index = to_sql_index(index)?;
        let entries = self.query_entries(
            "SELECT entry FROM ledger_entries WHERE subject_id = ?1 AND idx = ?2",
            subject_id,
            &[&subject_id, &index],
        )?;
        Ok(entries.into_iter().next())
    }

    fn head(&self, subject_id: &str) -> Result<Option<LedgerEntry>, StoreError> {
        let conn = self.reader.lock().map_err(lock_error)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT entry FROM ledger_entries WHERE subject_id = ?1 \
                 ORDER BY idx DESC LIMIT 1",
                params![subject_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| decode(subject_id, &json)).transpose()
    }

    fn append(&self, entry: LedgerEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(&entry)
            .map_err(|e| StoreError::Unavailable(format!("Serialization error: {}", e)))?;
        let index = to_sql_index(entry.index)?;

        let mut conn = self.writer.lock().map_err(lock_error)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let expected: i64 = tx.query_row(
            "SELECT COALESCE(MAX(idx) + 1, 0) FROM ledger_entries WHERE subject_id = ?1",
            params![entry.subject_id],
            |row| row.get(0),
        )?;
        if expected != index {
            return Err(StoreError::IndexConflict {
                subject_id: entry.subject_id,
                expected: expected as u64,
                actual: entry.index,
            });
        }

        tx.execute(
            "INSERT INTO ledger_entries (subject_id, idx, event_type, curr_hash, entry) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.subject_id,
                index,
                entry.event_type.as_str(),
                entry.curr_hash,
                json
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn scan(&self, subject_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        self.query_entries(
            "SELECT entry FROM ledger_entries WHERE subject_id = ?1 ORDER BY idx",
            subject_id,
            &[&subject_id],
        )
    }

    fn subjects(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.reader.lock().map_err(lock_error)?;
        let mut stmt = conn
            .prepare_cached("SELECT DISTINCT subject_id FROM ledger_entries ORDER BY subject_id")?;
        let subjects = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(subjects)
    }

    fn chain_len(&self, subject_id: &str) -> Result<u64, StoreError> {
        let conn = self.reader.lock().map_err(lock_error)?;
        let len: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger_entries WHERE subject_id = ?1",
            params![subject_id],
            |row| row.get(0),
        )?;
        Ok(len as u64)
    }
}
