//! Alert Persistence

use crate::manager::AlertRecord;
use crate::AlertError;
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Durable home of the alert book
pub trait AlertStore: Send + Sync {
    /// Every stored record in id order
    fn load(&self) -> Result<Vec<AlertRecord>, AlertError>;

    /// Insert or replace a record by id
    fn save(&self, record: &AlertRecord) -> Result<(), AlertError>;
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS alerts (
    id            INTEGER PRIMARY KEY,
    subject_id    TEXT    NOT NULL,
    ledger_index  INTEGER NOT NULL,
    record        TEXT    NOT NULL,
    UNIQUE (subject_id, ledger_index)
);
";

fn unavailable(e: impl std::fmt::Display) -> AlertError {
    AlertError::Unavailable(e.to_string())
}

/// Alert records kept in a SQLite table, usually next to the ledger
pub struct SqliteAlertStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteAlertStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AlertError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(unavailable)?;
        }

        let conn = Connection::open(&path).map_err(unavailable)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(unavailable)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(unavailable)?;
        conn.pragma_update(None, "synchronous", "FULL").map_err(unavailable)?;
        conn.execute_batch(SCHEMA_SQL).map_err(unavailable)?;

        info!("Opened alert store {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlertStore for SqliteAlertStore {
    fn load(&self) -> Result<Vec<AlertRecord>, AlertError> {
        let conn = self.conn.lock().map_err(unavailable)?;
        let mut stmt = conn
            .prepare("SELECT id, record FROM alerts ORDER BY id")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(unavailable)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, json) = row.map_err(unavailable)?;
            let record = serde_json::from_str(&json)
                .map_err(|e| AlertError::Unavailable(format!("alert {} unreadable: {}", id, e)))?;
            records.push(record);
        }
        Ok(records)
    }

    fn save(&self, record: &AlertRecord) -> Result<(), AlertError> {
        let json = serde_json::to_string(record).map_err(unavailable)?;
        let conn = self.conn.lock().map_err(unavailable)?;
        conn.execute(
            "INSERT INTO alerts (id, subject_id, ledger_index, record) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            params![
                record.id as i64,
                record.subject_id,
                record.ledger_index as i64,
                json
            ],
        )
        .map_err(unavailable)?;
        Ok(())
    }
}
