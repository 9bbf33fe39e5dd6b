//! Database schema definitions for the ledger store.
//!
//! One SQLite database per store:
//! 1. ledger.db: the hash-chained decision ledger and the unchained fallback log.

pub const LEDGER_DB_NAME: &str = "ledger.db";
pub const LEDGER_JOURNAL_NAME: &str = "ledger.events.jsonl";

/// Chained decision entries. No UPDATE or DELETE is ever issued against this table.
///
/// `UNIQUE(prev_entry_hash)` forbids two entries claiming the same predecessor,
/// so a fork cannot be written even by a second process.
pub const LEDGER_DB_SCHEMA_ENTRIES: &str = "
    CREATE TABLE IF NOT EXISTS ledger_entries (
        sequence_id INTEGER PRIMARY KEY,
        timestamp TEXT NOT NULL,
        case_reference TEXT NOT NULL,
        actor TEXT NOT NULL,
        mode TEXT NOT NULL,
        model_identifiers TEXT NOT NULL,
        run_hash TEXT NOT NULL,
        signoff_hash TEXT,
        prev_entry_hash TEXT NOT NULL UNIQUE,
        entry_hash TEXT NOT NULL UNIQUE
    )
";
pub const LEDGER_DB_SCHEMA_CASE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_ledger_case ON ledger_entries(case_reference, sequence_id)";

pub const LEDGER_DB_SCHEMA_NO_UPDATE: &str = "
    CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
    BEFORE UPDATE ON ledger_entries
    BEGIN
        SELECT RAISE(ABORT, 'ledger_entries is append-only');
    END
";
pub const LEDGER_DB_SCHEMA_NO_DELETE: &str = "
    CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
    BEFORE DELETE ON ledger_entries
    BEGIN
        SELECT RAISE(ABORT, 'ledger_entries is append-only');
    END
";

/// Backend substitutions; observability only, not chained.
pub const LEDGER_DB_SCHEMA_FALLBACKS: &str = "
    CREATE TABLE IF NOT EXISTS fallback_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        stage_name TEXT NOT NULL,
        primary_model TEXT NOT NULL,
        fallback_model TEXT,
        error_summary TEXT NOT NULL,
        success INTEGER NOT NULL
    )
";
pub const LEDGER_DB_SCHEMA_FALLBACK_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_fallback_primary ON fallback_events(primary_model)";

pub const LEDGER_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const LEDGER_SCHEMA_VERSION: &str = "1";

/// All statements needed to bring a fresh ledger database up.
pub const LEDGER_DB_SCHEMA: &[&str] = &[
    LEDGER_DB_SCHEMA_ENTRIES,
    LEDGER_DB_SCHEMA_CASE_INDEX,
    LEDGER_DB_SCHEMA_NO_UPDATE,
    LEDGER_DB_SCHEMA_NO_DELETE,
    LEDGER_DB_SCHEMA_FALLBACKS,
    LEDGER_DB_SCHEMA_FALLBACK_INDEX,
    LEDGER_DB_SCHEMA_META,
];
