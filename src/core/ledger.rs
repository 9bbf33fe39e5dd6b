//! Append-only, hash-chained decision ledger.
//!
//! Entries live in `ledger.db` and are only ever inserted. Each append reads
//! the tail, links the new entry to it and then inserts it with
//! [`AuditLedger::compare_and_append`], which re-checks the tail inside a
//! `BEGIN IMMEDIATE` transaction. A moved tail is a
//! [`VerdictError::ConcurrencyViolation`]; [`AuditLedger::append`] retries
//! against the new tail.
//!
//! The current head digest and length are mirrored into the `meta` table in the
//! same transaction, so a dropped tail entry is caught by [`AuditLedger::verify_ledger`].

use crate::core::broker::DbBroker;
use crate::core::canonical::CanonicalRecord;
use crate::core::case_ref;
use crate::core::chain::{self, Chained, ChainVerdict, GENESIS};
use crate::core::db;
use crate::core::error::VerdictError;
use crate::core::pipeline::PipelineRun;
use crate::core::router::{FallbackEvent, FallbackSink};
use crate::core::signoff::SignOff;
use crate::core::store::Store;
use crate::core::time;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Attempts at compare-and-append before giving up on a contended tail.
pub const MAX_APPEND_ATTEMPTS: u32 = 16;

const ACTOR: &str = "verdict";

const ENTRY_COLUMNS: &str = "sequence_id, timestamp, case_reference, actor, mode, \
     model_identifiers, run_hash, signoff_hash, prev_entry_hash, entry_hash";

/// What the caller supplies for a new entry; linking and hashing are the ledger's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub case_reference: String,
    pub actor: String,
    pub mode: String,
    pub model_identifiers: Vec<String>,
    pub run_hash: String,
    pub signoff_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence_id: u64,
    pub timestamp: String,
    pub case_reference: String,
    pub actor: String,
    pub mode: String,
    pub model_identifiers: Vec<String>,
    pub run_hash: String,
    pub signoff_hash: Option<String>,
    pub prev_entry_hash: String,
    pub entry_hash: String,
}

impl LedgerEntry {
    /// Link `new` onto a tail (or genesis) and compute its digest.
    pub fn link(
        new: &NewEntry,
        tail: Option<&LedgerEntry>,
        timestamp: &str,
    ) -> Result<Self, VerdictError> {
        let mut entry = Self {
            sequence_id: tail.map_or(1, |t| t.sequence_id + 1),
            timestamp: timestamp.to_string(),
            case_reference: new.case_reference.clone(),
            actor: new.actor.clone(),
            mode: new.mode.clone(),
            model_identifiers: new.model_identifiers.clone(),
            run_hash: new.run_hash.clone(),
            signoff_hash: new.signoff_hash.clone(),
            prev_entry_hash: tail.map_or_else(|| GENESIS.to_string(), |t| t.entry_hash.clone()),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash()?;
        Ok(entry)
    }

    /// Canonical record over every stored field except `entry_hash`.
    pub fn record(&self) -> Result<CanonicalRecord, VerdictError> {
        let sequence = i64::try_from(self.sequence_id).map_err(|_| {
            VerdictError::EncodingError(format!("sequence_id {} out of range", self.sequence_id))
        })?;
        Ok(CanonicalRecord::new()
            .integer("sequence_id", sequence)
            .text("timestamp", &self.timestamp)
            .text("case_reference", &self.case_reference)
            .text("actor", &self.actor)
            .text("mode", &self.mode)
            .text_list("model_identifiers", &self.model_identifiers)
            .text("run_hash", &self.run_hash)
            .optional_text("signoff_hash", self.signoff_hash.as_deref())
            .text("prev_entry_hash", &self.prev_entry_hash))
    }

    pub fn compute_hash(&self) -> Result<String, VerdictError> {
        chain::hash_record(&self.record()?)
    }
}

impl Chained for LedgerEntry {
    fn prev_hash(&self) -> &str {
        &self.prev_entry_hash
    }

    fn stored_hash(&self) -> &str {
        &self.entry_hash
    }

    fn recompute_hash(&self) -> Result<String, VerdictError> {
        self.compute_hash()
    }
}

/// Per primary model: how often it was substituted and how that went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackStats {
    pub total_fallbacks: u64,
    pub successful_fallbacks: u64,
    pub failed_fallbacks: u64,
}

/// A contiguous slice of the ledger as one read transaction saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub from: u64,
    pub to: u64,
    pub length: u64,
    /// `entry_hash` of the last entry in the whole ledger, or genesis.
    pub head: String,
    /// `entry_hash` of the entry before `from`, or genesis.
    pub anchor_prev_hash: String,
    pub entries: Vec<LedgerEntry>,
}

pub struct AuditLedger {
    store: Store,
    db_path: PathBuf,
    broker: DbBroker,
}

impl AuditLedger {
    /// Open the ledger in `store`, creating its schema if needed.
    pub fn open(store: &Store) -> Result<Self, VerdictError> {
        let broker = DbBroker::new(&store.root);
        let db_path = db::initialize_ledger_db(store, &broker)?;
        debug!(path = %db_path.display(), "ledger opened");
        Ok(Self {
            store: store.clone(),
            db_path,
            broker,
        })
    }

    /// Open a ledger that must already exist, without touching its schema.
    ///
    /// For audit commands: nothing is created and the database is only read.
    pub fn open_existing(store: &Store) -> Result<Self, VerdictError> {
        let db_path = db::ledger_db_path(store);
        if !db_path.is_file() {
            return Err(VerdictError::NotFound(format!(
                "no ledger at {}",
                db_path.display()
            )));
        }
        Ok(Self {
            store: store.clone(),
            db_path,
            broker: DbBroker::new(&store.root),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn broker(&self) -> &DbBroker {
        &self.broker
    }

    /// Append one entry, retrying while other writers move the tail.
    pub fn append(&self, new: NewEntry) -> Result<LedgerEntry, VerdictError> {
        validate_new_entry(&new)?;
        let mut last_conflict = None;
        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let tail = self.tail()?;
            let expected_tail = tail
                .as_ref()
                .map_or_else(|| GENESIS.to_string(), |t| t.entry_hash.clone());
            let entry = LedgerEntry::link(&new, tail.as_ref(), &time::now_iso8601())?;
            match self.compare_and_append(&entry, &expected_tail) {
                Ok(()) => {
                    info!(
                        sequence_id = entry.sequence_id,
                        entry_hash = %entry.entry_hash,
                        case = %entry.case_reference,
                        "ledger entry appended"
                    );
                    return Ok(entry);
                }
                Err(err @ VerdictError::ConcurrencyViolation { .. }) => {
                    warn!(attempt, error = %err, "ledger tail moved, retrying append");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_conflict.unwrap_or_else(|| VerdictError::ConcurrencyViolation {
            expected: "stable tail".to_string(),
            actual: "contended".to_string(),
        }))
    }

    /// Insert `entry` only if the ledger tail is still `expected_tail`.
    ///
    /// `entry` must already be linked to `expected_tail` and carry a correct
    /// digest; anything else is refused without touching the ledger.
    pub fn compare_and_append(
        &self,
        entry: &LedgerEntry,
        expected_tail: &str,
    ) -> Result<(), VerdictError> {
        if entry.prev_entry_hash != expected_tail {
            return Err(VerdictError::ValidationError(format!(
                "entry links to {} but expected tail is {}",
                entry.prev_entry_hash, expected_tail
            )));
        }
        if entry.compute_hash()? != entry.entry_hash {
            return Err(VerdictError::ValidationError(
                "entry_hash does not match entry contents".to_string(),
            ));
        }
        case_ref::require_opaque(&entry.case_reference)?;

        self.broker
            .with_write(&self.db_path, &entry.actor, "ledger.append", |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let (tail_seq, tail_hash) = read_tail_link(&tx)?;
                if tail_hash != expected_tail {
                    return Err(VerdictError::ConcurrencyViolation {
                        expected: expected_tail.to_string(),
                        actual: tail_hash,
                    });
                }
                if entry.sequence_id != tail_seq + 1 {
                    return Err(VerdictError::ValidationError(format!(
                        "entry sequence_id {} does not follow tail {}",
                        entry.sequence_id, tail_seq
                    )));
                }
                let models = serde_json::to_string(&entry.model_identifiers)?;
                let sequence_id = to_sql_int(entry.sequence_id)?;
                tx.execute(
                    &format!(
                        "INSERT INTO ledger_entries ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        ENTRY_COLUMNS
                    ),
                    params![
                        sequence_id,
                        entry.timestamp,
                        entry.case_reference,
                        entry.actor,
                        entry.mode,
                        models,
                        entry.run_hash,
                        entry.signoff_hash,
                        entry.prev_entry_hash,
                        entry.entry_hash,
                    ],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO meta(key, value) VALUES('head_hash', ?1)",
                    params![entry.entry_hash],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO meta(key, value) VALUES('length', ?1)",
                    params![entry.sequence_id.to_string()],
                )?;
                tx.commit()?;
                Ok(())
            })
    }

    /// Persist a decision: a complete, verifying run approved by a human.
    pub fn commit_decision(
        &self,
        run: &PipelineRun,
        signoff: &SignOff,
        mode: &str,
    ) -> Result<LedgerEntry, VerdictError> {
        if !run.is_complete() {
            return Err(VerdictError::ValidationError(format!(
                "run {} is {:?}; only complete runs can be committed",
                run.run_id, run.state
            )));
        }
        run.verify().into_result()?;
        if !signoff.is_self_consistent() {
            return Err(VerdictError::ValidationError(
                "sign-off signature does not match its fields".to_string(),
            ));
        }
        self.append(NewEntry {
            case_reference: run.case_reference.clone(),
            actor: signoff.actor.clone(),
            mode: mode.to_string(),
            model_identifiers: run.model_identifiers(),
            run_hash: run.head_hash(),
            signoff_hash: Some(signoff.signature_hash.clone()),
        })
    }

    pub fn entries(&self) -> Result<Vec<LedgerEntry>, VerdictError> {
        self.broker
            .with_read(&self.db_path, ACTOR, "ledger.entries", |conn| {
                query_entries(
                    conn,
                    &format!(
                        "SELECT {} FROM ledger_entries ORDER BY sequence_id ASC",
                        ENTRY_COLUMNS
                    ),
                    [],
                )
            })
    }

    /// Entries with `from <= sequence_id <= to`, in order.
    pub fn entries_range(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>, VerdictError> {
        if from == 0 || from > to {
            return Err(VerdictError::ValidationError(format!(
                "invalid range {}..={}",
                from, to
            )));
        }
        self.broker
            .with_read(&self.db_path, ACTOR, "ledger.range", |conn| {
                query_entries(
                    conn,
                    &format!(
                        "SELECT {} FROM ledger_entries WHERE sequence_id BETWEEN ?1 AND ?2 ORDER BY sequence_id ASC",
                        ENTRY_COLUMNS
                    ),
                    params![to_sql_int(from)?, to_sql_int(to)?],
                )
            })
    }

    pub fn len(&self) -> Result<u64, VerdictError> {
        self.broker
            .with_read(&self.db_path, ACTOR, "ledger.len", |conn| {
                count_entries(conn)
            })
    }

    pub fn is_empty(&self) -> Result<bool, VerdictError> {
        Ok(self.len()? == 0)
    }

    pub fn tail(&self) -> Result<Option<LedgerEntry>, VerdictError> {
        let mut tail = self
            .broker
            .with_read(&self.db_path, ACTOR, "ledger.tail", |conn| {
                query_entries(
                    conn,
                    &format!(
                        "SELECT {} FROM ledger_entries ORDER BY sequence_id DESC LIMIT 1",
                        ENTRY_COLUMNS
                    ),
                    [],
                )
            })?;
        Ok(tail.pop())
    }

    /// Head digest and length as recorded at the last append.
    pub fn recorded_head(&self) -> Result<(String, u64), VerdictError> {
        self.broker
            .with_read(&self.db_path, ACTOR, "ledger.head", read_recorded_head)
    }

    /// Length, head and entries `from..=to` read from one consistent snapshot.
    ///
    /// `to` defaults to the snapshot's length, so appends that land while the
    /// range is read are simply not part of it.
    pub fn snapshot_range(
        &self,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<LedgerSnapshot, VerdictError> {
        self.broker
            .with_read(&self.db_path, ACTOR, "ledger.snapshot", |conn| {
                let tx = conn.unchecked_transaction()?;
                let length = count_entries(&tx)?;
                let from = from.unwrap_or(1);
                let to = to.unwrap_or(length);
                if from == 0 || to > length || (length > 0 && from > to) {
                    return Err(VerdictError::ValidationError(format!(
                        "range {}..={} outside ledger of length {}",
                        from, to, length
                    )));
                }
                let (_, head) = read_tail_link(&tx)?;
                let anchor_prev_hash = if from <= 1 {
                    GENESIS.to_string()
                } else {
                    tx.query_row(
                        "SELECT entry_hash FROM ledger_entries WHERE sequence_id = ?1",
                        params![to_sql_int(from - 1)?],
                        |r| r.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| VerdictError::NotFound(format!("ledger entry {}", from - 1)))?
                };
                let entries = if length == 0 {
                    Vec::new()
                } else {
                    query_entries(
                        &tx,
                        &format!(
                            "SELECT {} FROM ledger_entries WHERE sequence_id BETWEEN ?1 AND ?2 ORDER BY sequence_id ASC",
                            ENTRY_COLUMNS
                        ),
                        params![to_sql_int(from)?, to_sql_int(to)?],
                    )?
                };
                Ok(LedgerSnapshot {
                    from,
                    to,
                    length,
                    head,
                    anchor_prev_hash,
                    entries,
                })
            })
    }

    /// Most recent entries for one case, newest first.
    pub fn entries_for_case(
        &self,
        case_reference: &str,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, VerdictError> {
        self.broker
            .with_read(&self.db_path, ACTOR, "ledger.history", |conn| {
                query_entries(
                    conn,
                    &format!(
                        "SELECT {} FROM ledger_entries WHERE case_reference = ?1 ORDER BY sequence_id DESC LIMIT ?2",
                        ENTRY_COLUMNS
                    ),
                    params![case_reference, limit],
                )
            })
    }

    /// Walk the whole ledger from genesis and check it against the recorded head.
    pub fn verify_ledger(&self) -> Result<ChainVerdict, VerdictError> {
        // entries and the recorded head must come from the same snapshot
        let (entries, (head, len)) =
            self.broker
                .with_read(&self.db_path, ACTOR, "ledger.verify", |conn| {
                    let tx = conn.unchecked_transaction()?;
                    let entries = query_entries(
                        &tx,
                        &format!(
                            "SELECT {} FROM ledger_entries ORDER BY sequence_id ASC",
                            ENTRY_COLUMNS
                        ),
                        [],
                    )?;
                    Ok((entries, read_recorded_head(&tx)?))
                })?;
        let len = usize::try_from(len).map_err(|_| {
            VerdictError::EncodingError(format!("recorded length {} too large", len))
        })?;

        let mut verdict = chain::verify_chain(&entries);
        if verdict.valid {
            verdict = check_sequence(&entries);
        }
        if verdict.valid {
            verdict = chain::verify_chain_with_head(&entries, &head, len);
        }
        match verdict.first_invalid_index {
            None => info!(checked = verdict.checked, "ledger verified"),
            Some(index) => error!(
                index,
                reason = verdict.reason.as_deref().unwrap_or(""),
                "ledger integrity failure"
            ),
        }
        Ok(verdict)
    }

    pub fn record_fallback(&self, event: &FallbackEvent) -> Result<(), VerdictError> {
        self.broker
            .with_write(&self.db_path, ACTOR, "fallback.record", |conn| {
                conn.execute(
                    "INSERT INTO fallback_events (timestamp, stage_name, primary_model, fallback_model, error_summary, success)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        event.timestamp,
                        event.stage_name,
                        event.primary_model,
                        event.fallback_model,
                        event.error_summary,
                        event.success,
                    ],
                )?;
                Ok(())
            })
    }

    /// Most recent fallback events, newest first.
    pub fn fallback_events(&self, limit: u32) -> Result<Vec<FallbackEvent>, VerdictError> {
        self.broker
            .with_read(&self.db_path, ACTOR, "fallback.list", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, stage_name, primary_model, fallback_model, error_summary, success
                     FROM fallback_events ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], |row| {
                    Ok(FallbackEvent {
                        timestamp: row.get(0)?,
                        stage_name: row.get(1)?,
                        primary_model: row.get(2)?,
                        fallback_model: row.get(3)?,
                        error_summary: row.get(4)?,
                        success: row.get(5)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
    }

    pub fn fallback_statistics(&self) -> Result<BTreeMap<String, FallbackStats>, VerdictError> {
        self.broker
            .with_read(&self.db_path, ACTOR, "fallback.stats", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT primary_model, COUNT(*), SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END)
                     FROM fallback_events GROUP BY primary_model",
                )?;
                let rows = stmt.query_map([], |row| {
                    let total = from_sql_int(row.get(1)?, 1)?;
                    let successful = from_sql_int(row.get(2)?, 2)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        FallbackStats {
                            total_fallbacks: total,
                            successful_fallbacks: successful,
                            failed_fallbacks: total - successful,
                        },
                    ))
                })?;
                Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
            })
    }
}

impl FallbackSink for AuditLedger {
    fn record(&self, event: &FallbackEvent) -> Result<(), VerdictError> {
        self.record_fallback(event)
    }
}

fn validate_new_entry(new: &NewEntry) -> Result<(), VerdictError> {
    case_ref::require_opaque(&new.case_reference)?;
    if new.actor.trim().is_empty() {
        return Err(VerdictError::ValidationError("entry has no actor".to_string()));
    }
    if new.mode.trim().is_empty() {
        return Err(VerdictError::ValidationError("entry has no mode".to_string()));
    }
    if new.run_hash.trim().is_empty() {
        return Err(VerdictError::ValidationError("entry has no run_hash".to_string()));
    }
    Ok(())
}

fn read_tail_link(conn: &Connection) -> Result<(u64, String), VerdictError> {
    let tail: Option<(u64, String)> = conn
        .query_row(
            "SELECT sequence_id, entry_hash FROM ledger_entries ORDER BY sequence_id DESC LIMIT 1",
            [],
            |r| Ok((from_sql_int(r.get(0)?, 0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(tail.unwrap_or_else(|| (0, GENESIS.to_string())))
}

fn read_recorded_head(conn: &Connection) -> Result<(String, u64), VerdictError> {
    let head: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'head_hash'", [], |r| r.get(0))
        .optional()?;
    let len: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'length'", [], |r| r.get(0))
        .optional()?;
    let len = match len {
        Some(v) => v.parse::<u64>().map_err(|e| {
            VerdictError::EncodingError(format!("recorded length '{}': {}", v, e))
        })?,
        None => 0,
    };
    Ok((head.unwrap_or_else(|| GENESIS.to_string()), len))
}

fn count_entries(conn: &Connection) -> Result<u64, VerdictError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |r| r.get(0))?;
    Ok(from_sql_int(count, 0)?)
}

/// SQLite integers are signed; sequence ids and counts never are.
fn to_sql_int(value: u64) -> Result<i64, VerdictError> {
    i64::try_from(value).map_err(|_| {
        VerdictError::EncodingError(format!("{} does not fit an SQLite integer", value))
    })
}

fn from_sql_int(value: i64, column: usize) -> rusqlite::Result<u64> {
    u64::try_from(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Integer, Box::new(e)))
}

fn query_entries<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<LedgerEntry>, VerdictError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_entry)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let models: String = row.get(5)?;
    let model_identifiers = serde_json::from_str(&models)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(LedgerEntry {
        sequence_id: from_sql_int(row.get(0)?, 0)?,
        timestamp: row.get(1)?,
        case_reference: row.get(2)?,
        actor: row.get(3)?,
        mode: row.get(4)?,
        model_identifiers,
        run_hash: row.get(6)?,
        signoff_hash: row.get(7)?,
        prev_entry_hash: row.get(8)?,
        entry_hash: row.get(9)?,
    })
}

/// Sequence ids must run 1, 2, 3, … with no gaps.
fn check_sequence(entries: &[LedgerEntry]) -> ChainVerdict {
    for (index, entry) in entries.iter().enumerate() {
        let expected = index as u64 + 1;
        if entry.sequence_id != expected {
            return ChainVerdict::broken(
                index,
                format!(
                    "sequence gap: expected sequence_id {} but found {}",
                    expected, entry.sequence_id
                ),
            );
        }
    }
    ChainVerdict::ok(entries.len())
}
