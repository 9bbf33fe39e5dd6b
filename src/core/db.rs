use crate::core::broker::DbBroker;
use crate::core::error::VerdictError;
use crate::core::schemas;
use crate::core::store::Store;
use rusqlite::{Connection, params};
use std::path::PathBuf;
use std::time::Duration;

pub fn db_connect(db_path: &str, busy_timeout_secs: u32) -> Result<Connection, VerdictError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(u64::from(busy_timeout_secs)))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

pub fn ledger_db_path(store: &Store) -> PathBuf {
    store.root.join(schemas::LEDGER_DB_NAME)
}

/// Create the ledger tables if they are missing. Idempotent.
pub fn initialize_ledger_db(store: &Store, broker: &DbBroker) -> Result<PathBuf, VerdictError> {
    let db_path = ledger_db_path(store);
    broker.with_write(&db_path, "verdict", "ledger.init", |conn| {
        for statement in schemas::LEDGER_DB_SCHEMA {
            conn.execute(statement, [])?;
        }
        conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES('schema_version', ?1)",
            params![schemas::LEDGER_SCHEMA_VERSION],
        )?;
        Ok(())
    })?;
    Ok(db_path)
}
