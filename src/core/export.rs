//! Self-contained export documents and their independent verification.
//!
//! An export carries every hashed field of every record plus the rules needed
//! to recompute the digests, so a verifier needs nothing but the document.

use crate::core::canonical::CANONICAL_FORMAT;
use crate::core::chain::{self, ChainStep, ChainVerdict, GENESIS, HASH_ALGORITHM};
use crate::core::confidence::{ConfidenceBreakdown, ValueSource, WEIGHT_SUM_TOLERANCE};
use crate::core::error::VerdictError;
use crate::core::ledger::{AuditLedger, LedgerEntry};
use crate::core::pipeline::{PipelineRun, RunState};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

pub const EXPORT_FORMAT_VERSION: &str = "verdict-export/1";

pub const STEP_HASHED_FIELDS: &[&str] = &[
    "stage_name",
    "input",
    "output",
    "prev_hash",
    "timestamp",
    "confidence",
    "model_identifier",
];

pub const ENTRY_HASHED_FIELDS: &[&str] = &[
    "sequence_id",
    "timestamp",
    "case_reference",
    "actor",
    "mode",
    "model_identifiers",
    "run_hash",
    "signoff_hash",
    "prev_entry_hash",
];

/// How digests in the document are formed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashingRules {
    pub hash_algorithm: String,
    pub canonicalization: String,
    pub genesis: String,
    pub hashed_fields: Vec<String>,
}

impl HashingRules {
    fn current(fields: &[&str]) -> Self {
        Self {
            hash_algorithm: HASH_ALGORITHM.to_string(),
            canonicalization: CANONICAL_FORMAT.to_string(),
            genesis: GENESIS.to_string(),
            hashed_fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn unsupported(&self) -> Option<String> {
        if self.hash_algorithm != HASH_ALGORITHM {
            return Some(format!("unsupported hash algorithm '{}'", self.hash_algorithm));
        }
        if self.canonicalization != CANONICAL_FORMAT {
            return Some(format!(
                "unsupported canonicalization '{}'",
                self.canonicalization
            ));
        }
        if self.genesis != GENESIS {
            return Some(format!("unexpected genesis sentinel '{}'", self.genesis));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunExport {
    pub format_version: String,
    pub exported_at: String,
    pub rules: HashingRules,
    pub run_id: String,
    pub case_reference: String,
    pub state: RunState,
    pub weights_version: String,
    pub step_count: usize,
    pub head_hash: String,
    pub steps: Vec<ChainStep>,
    pub final_output: Option<String>,
    pub final_confidence: Option<f64>,
    pub confidence_breakdown: Option<ConfidenceBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerExport {
    pub format_version: String,
    pub exported_at: String,
    pub rules: HashingRules,
    pub from_sequence: u64,
    pub to_sequence: u64,
    /// `entry_hash` of the entry before `from_sequence`, or genesis.
    pub anchor_prev_hash: String,
    pub ledger_head: String,
    pub ledger_length: u64,
    pub entries: Vec<LedgerEntry>,
}

/// Either kind of export, as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportDocument {
    Run(RunExport),
    Ledger(LedgerExport),
}

pub fn export_run(run: &PipelineRun) -> RunExport {
    RunExport {
        format_version: EXPORT_FORMAT_VERSION.to_string(),
        exported_at: time::now_iso8601(),
        rules: HashingRules::current(STEP_HASHED_FIELDS),
        run_id: run.run_id.clone(),
        case_reference: run.case_reference.clone(),
        state: run.state,
        weights_version: run.weights_version.clone(),
        step_count: run.steps.len(),
        head_hash: run.head_hash(),
        steps: run.steps.clone(),
        final_output: run.final_output.clone(),
        final_confidence: run.final_confidence,
        confidence_breakdown: run.confidence_breakdown.clone(),
    }
}

/// Export entries `from..=to` (defaults: the whole ledger).
///
/// Everything in the document comes from one read snapshot, so concurrent
/// appends never leave it inconsistent with itself.
pub fn export_ledger(
    ledger: &AuditLedger,
    from: Option<u64>,
    to: Option<u64>,
) -> Result<LedgerExport, VerdictError> {
    let snapshot = ledger.snapshot_range(from, to)?;
    info!(
        from = snapshot.from,
        to = snapshot.to,
        entries = snapshot.entries.len(),
        "ledger exported"
    );
    Ok(LedgerExport {
        format_version: EXPORT_FORMAT_VERSION.to_string(),
        exported_at: time::now_iso8601(),
        rules: HashingRules::current(ENTRY_HASHED_FIELDS),
        from_sequence: snapshot.from,
        to_sequence: snapshot.to,
        anchor_prev_hash: snapshot.anchor_prev_hash,
        ledger_head: snapshot.head,
        ledger_length: snapshot.length,
        entries: snapshot.entries,
    })
}

/// Recompute every step digest, the head, the final output and the confidence.
pub fn verify_run_export(doc: &RunExport) -> ChainVerdict {
    if let Some(reason) = doc.rules.unsupported() {
        return ChainVerdict::broken(0, reason);
    }
    let verdict = chain::verify_chain_with_head(&doc.steps, &doc.head_hash, doc.step_count);
    if !verdict.valid {
        return verdict;
    }
    if doc.state == RunState::Complete {
        if let Some(broken) = check_final(doc) {
            return broken;
        }
    }
    verdict
}

fn check_final(doc: &RunExport) -> Option<ChainVerdict> {
    let last = doc.steps.len().saturating_sub(1);
    let final_output = doc.steps.last().map(|s| s.output_payload());
    if doc.final_output.as_deref() != final_output {
        return Some(ChainVerdict::broken(
            last,
            "final output differs from the last step's output",
        ));
    }
    let Some(breakdown) = &doc.confidence_breakdown else {
        return Some(ChainVerdict::broken(last, "complete run without confidence breakdown"));
    };
    if !breakdown.is_consistent() {
        return Some(ChainVerdict::broken(
            last,
            "confidence breakdown does not sum to its total",
        ));
    }
    let matches_total = doc
        .final_confidence
        .is_some_and(|c| (c - breakdown.total).abs() <= WEIGHT_SUM_TOLERANCE);
    if !matches_total {
        return Some(ChainVerdict::broken(
            last,
            "final confidence differs from the breakdown total",
        ));
    }
    for term in &breakdown.terms {
        let Some((index, step)) = doc
            .steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.stage_name() == term.stage)
        else {
            return Some(ChainVerdict::broken(
                last,
                format!("confidence term for unknown stage '{}'", term.stage),
            ));
        };
        let consistent = match (term.source, step.confidence()) {
            (ValueSource::Reported, Some(c)) => c == term.value,
            (ValueSource::Baseline, None) => true,
            _ => false,
        };
        if !consistent {
            return Some(ChainVerdict::broken(
                index,
                format!(
                    "confidence term for '{}' does not match the recorded step",
                    term.stage
                ),
            ));
        }
    }
    None
}

/// Recompute every entry digest from the anchor and check the range bounds.
pub fn verify_ledger_export(doc: &LedgerExport) -> ChainVerdict {
    if let Some(reason) = doc.rules.unsupported() {
        return ChainVerdict::broken(0, reason);
    }
    if doc.from_sequence <= 1 && doc.anchor_prev_hash != GENESIS {
        return ChainVerdict::broken(0, "range starts at 1 but is not anchored at genesis");
    }
    let Some(expected_len) = expected_entry_count(doc) else {
        return ChainVerdict::broken(
            0,
            format!(
                "invalid range {}..={} for ledger of length {}",
                doc.from_sequence, doc.to_sequence, doc.ledger_length
            ),
        );
    };
    let verdict = chain::verify_chain_from(&doc.anchor_prev_hash, &doc.entries);
    if !verdict.valid {
        return verdict;
    }
    for (index, entry) in doc.entries.iter().enumerate() {
        let expected = u64::try_from(index)
            .ok()
            .and_then(|i| doc.from_sequence.checked_add(i));
        if expected != Some(entry.sequence_id) {
            return ChainVerdict::broken(
                index,
                format!(
                    "sequence gap: expected sequence_id {} but found {}",
                    expected.map_or_else(|| "none".to_string(), |e| e.to_string()),
                    entry.sequence_id
                ),
            );
        }
    }
    if doc.entries.len() < expected_len {
        return ChainVerdict::broken(
            doc.entries.len(),
            format!(
                "truncated: expected {} entries, found {}",
                expected_len,
                doc.entries.len()
            ),
        );
    }
    if doc.entries.len() > expected_len {
        return ChainVerdict::broken(expected_len, "entry beyond exported range");
    }
    if doc.to_sequence == doc.ledger_length {
        let end = doc
            .entries
            .last()
            .map_or(doc.anchor_prev_hash.as_str(), |e| e.entry_hash.as_str());
        if end != doc.ledger_head {
            return ChainVerdict::broken(
                doc.entries.len().saturating_sub(1),
                "range ends at the ledger head but digests differ",
            );
        }
    }
    verdict
}

/// Entries a well-formed document must carry, or `None` for an impossible range.
fn expected_entry_count(doc: &LedgerExport) -> Option<usize> {
    if doc.ledger_length == 0 {
        return (doc.from_sequence <= 1 && doc.to_sequence == 0).then_some(0);
    }
    if doc.from_sequence == 0
        || doc.to_sequence < doc.from_sequence
        || doc.to_sequence > doc.ledger_length
    {
        return None;
    }
    let count = (doc.to_sequence - doc.from_sequence).checked_add(1)?;
    usize::try_from(count).ok()
}

pub fn verify_export(doc: &ExportDocument) -> ChainVerdict {
    match doc {
        ExportDocument::Run(run) => verify_run_export(run),
        ExportDocument::Ledger(ledger) => verify_ledger_export(ledger),
    }
}

pub fn write_export(path: &Path, doc: &ExportDocument) -> Result<(), VerdictError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let body = serde_json::to_string_pretty(doc)?;
    fs::write(path, body)?;
    Ok(())
}

pub fn read_export(path: &Path) -> Result<ExportDocument, VerdictError> {
    let raw = fs::read_to_string(path)?;
    let doc: ExportDocument = serde_json::from_str(&raw)?;
    let version = match &doc {
        ExportDocument::Run(r) => &r.format_version,
        ExportDocument::Ledger(l) => &l.format_version,
    };
    if version != EXPORT_FORMAT_VERSION {
        return Err(VerdictError::ValidationError(format!(
            "unsupported export format '{}'",
            version
        )));
    }
    Ok(doc)
}
