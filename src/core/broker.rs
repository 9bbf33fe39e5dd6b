use crate::core::error::VerdictError;
use crate::core::pool;
use crate::core::schemas;
use crate::core::time;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::error;

/// The DB broker is the single route to ledger storage.
///
/// Every operation goes through the global pool and leaves one line in the
/// store's JSONL journal recording who did what and whether it succeeded.
pub struct DbBroker {
    journal_path: PathBuf,
    journal_lock: Mutex<()>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            journal_path: root.join(schemas::LEDGER_JOURNAL_NAME),
            journal_lock: Mutex::new(()),
        }
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Serialized write access to `db_path`, retried while the database is busy.
    ///
    /// The journal line is written after the operation has finished; a journal
    /// failure is logged and never masks the operation's own result.
    pub fn with_write<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op: &str,
        mut f: F,
    ) -> Result<R, VerdictError>
    where
        F: FnMut(&mut Connection) -> Result<R, VerdictError>,
    {
        let result = pool::retry_on_busy(|| pool::global_pool().with_write(db_path, &mut f));
        self.record(db_path, actor, op, &result);
        result
    }

    pub fn with_read<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op: &str,
        mut f: F,
    ) -> Result<R, VerdictError>
    where
        F: FnMut(&Connection) -> Result<R, VerdictError>,
    {
        let result = pool::retry_on_busy(|| pool::global_pool().with_read(db_path, &mut f));
        self.record(db_path, actor, op, &result);
        result
    }

    fn record<R>(&self, db_path: &Path, actor: &str, op: &str, result: &Result<R, VerdictError>) {
        if let Err(err) = self.journal(db_path, actor, op, result) {
            error!(
                journal = %self.journal_path.display(),
                op,
                error = %err,
                "failed to journal ledger operation"
            );
        }
    }

    fn journal<R>(
        &self,
        db_path: &Path,
        actor: &str,
        op: &str,
        result: &Result<R, VerdictError>,
    ) -> Result<(), VerdictError> {
        let status = match result {
            Ok(_) => "success",
            Err(VerdictError::ConcurrencyViolation { .. }) => "conflict",
            Err(_) => "error",
        };
        let ev = BrokerEvent {
            ts: time::now_iso8601(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            db_id: db_path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            status: status.to_string(),
        };
        let mut line = serde_json::to_string(&ev)?;
        line.push('\n');

        let _guard = self
            .journal_lock
            .lock()
            .map_err(|_| VerdictError::ValidationError("journal lock poisoned".to_string()))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        f.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read back the journal, oldest first.
    pub fn events(&self) -> Result<Vec<BrokerEvent>, VerdictError> {
        if !self.journal_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.journal_path)?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(VerdictError::from))
            .collect()
    }
}
