//! SQLite connection pool with read/write separation and retry logic.
//!
//! - Maintains a **write mutex** per DB for serialized write access
//! - Creates fresh **read connections** per operation (no mutex, concurrent via WAL)
//! - Retries busy/locked failures with exponential backoff
//!
//! Connections are NOT pooled (opened fresh each time) so that a second
//! process appending to the same ledger only ever contends on SQLite's own lock.

use crate::core::db;
use crate::core::error::VerdictError;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Maximum retry attempts for busy/locked errors.
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 100;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 5_000;

/// Write connection busy_timeout in seconds.
const WRITE_BUSY_TIMEOUT_SECS: u32 = 5;
/// Read connection busy_timeout in seconds.
const READ_BUSY_TIMEOUT_SECS: u32 = 5;

/// Per-database entry holding a write mutex for serialized write access.
struct PoolEntry {
    write_lock: Mutex<()>,
    db_path: PathBuf,
}

/// Connection pool providing read/write separation per SQLite database.
pub struct SqlitePool {
    entries: Mutex<HashMap<PathBuf, Arc<PoolEntry>>>,
}

impl SqlitePool {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get_entry(&self, db_path: &Path) -> Result<Arc<PoolEntry>, VerdictError> {
        let key = db_path.to_path_buf();
        let mut entries = self.entries.lock().map_err(|_| {
            VerdictError::ValidationError("SqlitePool entries lock poisoned".to_string())
        })?;
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            Arc::new(PoolEntry {
                write_lock: Mutex::new(()),
                db_path: key,
            })
        });
        Ok(Arc::clone(entry))
    }

    /// Execute a closure with a write connection for the given DB path.
    /// Write access is serialized per-DB via mutex.
    pub fn with_write<F, R>(&self, db_path: &Path, f: F) -> Result<R, VerdictError>
    where
        F: FnOnce(&mut Connection) -> Result<R, VerdictError>,
    {
        let entry = self.get_entry(db_path)?;
        let _guard = entry
            .write_lock
            .lock()
            .map_err(|_| VerdictError::ValidationError("Pool write lock poisoned".to_string()))?;

        let mut conn = db::db_connect(&entry.db_path.to_string_lossy(), WRITE_BUSY_TIMEOUT_SECS)?;

        f(&mut conn)
    }

    /// Execute a closure with a read connection (no mutex serialization).
    /// WAL mode allows concurrent readers across threads and processes.
    pub fn with_read<F, R>(&self, db_path: &Path, f: F) -> Result<R, VerdictError>
    where
        F: FnOnce(&Connection) -> Result<R, VerdictError>,
    {
        let conn = db::db_connect(&db_path.to_string_lossy(), READ_BUSY_TIMEOUT_SECS)?;

        f(&conn)
    }
}

/// Retry a closure on `SQLITE_BUSY` / `DatabaseLocked` with exponential backoff.
pub fn retry_on_busy<F, R>(mut f: F) -> Result<R, VerdictError>
where
    F: FnMut() -> Result<R, VerdictError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_error(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay_ms = (BASE_DELAY_MS * 2u64.pow(attempt - 1)).min(MAX_DELAY_MS);
                warn!(attempt, delay_ms, "database busy, backing off");
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if an error is a SQLite busy/locked error that is retryable.
pub fn is_busy_error(err: &VerdictError) -> bool {
    match err {
        VerdictError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Global pool instance (same lifetime as the process).
pub fn global_pool() -> &'static SqlitePool {
    static POOL: OnceLock<SqlitePool> = OnceLock::new();
    POOL.get_or_init(SqlitePool::new)
}
