//! Hash-chain engine.
//!
//! Computes and validates linked SHA-256 digests over canonical records. The
//! same walk is used for pipeline steps and for ledger entries: each record
//! stores the digest of its predecessor (or [`genesis`]) and a digest over all
//! of its own stored fields.

use crate::core::canonical::CanonicalRecord;
use crate::core::error::VerdictError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Starting `prev_hash` for every chain. Not hex, so it never equals a real digest.
pub const GENESIS: &str = "GENESIS";

/// Digest algorithm recorded in exports.
pub const HASH_ALGORITHM: &str = "sha256";

pub fn genesis() -> &'static str {
    GENESIS
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn hash_record(record: &CanonicalRecord) -> Result<String, VerdictError> {
    Ok(sha256_hex(&record.encode()?))
}

/// Something that sits in a hash chain.
pub trait Chained {
    fn prev_hash(&self) -> &str;
    fn stored_hash(&self) -> &str;
    /// Recompute the digest from the record's stored fields.
    fn recompute_hash(&self) -> Result<String, VerdictError>;
}

/// Outcome of walking a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerdict {
    pub valid: bool,
    pub first_invalid_index: Option<usize>,
    pub checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChainVerdict {
    pub fn ok(checked: usize) -> Self {
        Self {
            valid: true,
            first_invalid_index: None,
            checked,
            reason: None,
        }
    }

    pub fn broken(index: usize, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            first_invalid_index: Some(index),
            checked: index,
            reason: Some(reason.into()),
        }
    }

    pub fn into_result(self) -> Result<usize, VerdictError> {
        match self.first_invalid_index {
            None if self.valid => Ok(self.checked),
            index => Err(VerdictError::ChainIntegrityError {
                index: index.unwrap_or(0),
                reason: self.reason.unwrap_or_else(|| "chain invalid".to_string()),
            }),
        }
    }
}

/// Walk `items` from the genesis sentinel.
pub fn verify_chain<T: Chained>(items: &[T]) -> ChainVerdict {
    verify_chain_from(GENESIS, items)
}

/// Walk `items` starting from an explicit anchor digest.
///
/// Stops at the first record whose `prev_hash` does not match the running
/// expectation or whose recomputed digest differs from the stored one.
pub fn verify_chain_from<T: Chained>(anchor: &str, items: &[T]) -> ChainVerdict {
    let mut expected_prev = anchor.to_string();
    for (index, item) in items.iter().enumerate() {
        if item.prev_hash() != expected_prev {
            return ChainVerdict::broken(
                index,
                format!(
                    "chain break: expected prev_hash {} but found {}",
                    short(&expected_prev),
                    short(item.prev_hash())
                ),
            );
        }
        let computed = match item.recompute_hash() {
            Ok(h) => h,
            Err(e) => return ChainVerdict::broken(index, format!("record not encodable: {}", e)),
        };
        if computed != item.stored_hash() {
            return ChainVerdict::broken(index, "hash mismatch: record has been modified");
        }
        expected_prev = computed;
    }
    ChainVerdict::ok(items.len())
}

/// Like [`verify_chain`], but also pins the chain to a recorded head digest and
/// length so that dropped or appended tail records are caught.
pub fn verify_chain_with_head<T: Chained>(
    items: &[T],
    expected_head: &str,
    expected_len: usize,
) -> ChainVerdict {
    let verdict = verify_chain(items);
    if !verdict.valid {
        return verdict;
    }
    if items.len() < expected_len {
        return ChainVerdict::broken(
            items.len(),
            format!(
                "truncated: expected {} records, found {}",
                expected_len,
                items.len()
            ),
        );
    }
    if items.len() > expected_len {
        return ChainVerdict::broken(expected_len, "record beyond recorded head");
    }
    let head = items.last().map_or(GENESIS, |i| i.stored_hash());
    if head != expected_head {
        return ChainVerdict::broken(
            items.len().saturating_sub(1),
            format!(
                "head mismatch: expected {} but chain ends at {}",
                short(expected_head),
                short(head)
            ),
        );
    }
    verdict
}

fn short(h: &str) -> &str {
    h.get(..16).unwrap_or(h)
}

/// Fields of a pipeline step that feed its digest, minus the link itself.
#[derive(Debug, Clone, Copy)]
pub struct StepContent<'a> {
    pub stage_name: &'a str,
    pub input_payload: &'a str,
    pub output_payload: &'a str,
    pub timestamp: &'a str,
    pub confidence: Option<f64>,
    pub model_identifier: &'a str,
}

impl StepContent<'_> {
    pub fn record(&self, prev_hash: &str) -> Result<CanonicalRecord, VerdictError> {
        Ok(CanonicalRecord::new()
            .text("stage_name", self.stage_name)
            .text("input", self.input_payload)
            .text("output", self.output_payload)
            .text("prev_hash", prev_hash)
            .text("timestamp", self.timestamp)
            .optional_float("confidence", self.confidence)?
            .text("model_identifier", self.model_identifier))
    }
}

/// Digest of one pipeline step linked to `prev_hash`.
pub fn compute_step_hash(
    content: &StepContent<'_>,
    prev_hash: &str,
) -> Result<String, VerdictError> {
    hash_record(&content.record(prev_hash)?)
}

/// One stage's recorded input/output plus the digest linking it to its predecessor.
///
/// Fields are private: a step is sealed once and only read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    stage_name: String,
    input_payload: String,
    output_payload: String,
    timestamp: String,
    prev_hash: String,
    step_hash: String,
    confidence: Option<f64>,
    model_identifier: String,
}

impl ChainStep {
    /// Hash `content` against `prev_hash` and freeze the result.
    pub fn seal(content: StepContent<'_>, prev_hash: &str) -> Result<Self, VerdictError> {
        if let Some(c) = content.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(VerdictError::ValidationError(format!(
                    "stage '{}' confidence {} outside [0, 1]",
                    content.stage_name, c
                )));
            }
        }
        let step_hash = compute_step_hash(&content, prev_hash)?;
        Ok(Self {
            stage_name: content.stage_name.to_string(),
            input_payload: content.input_payload.to_string(),
            output_payload: content.output_payload.to_string(),
            timestamp: content.timestamp.to_string(),
            prev_hash: prev_hash.to_string(),
            step_hash,
            confidence: content.confidence,
            model_identifier: content.model_identifier.to_string(),
        })
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    pub fn input_payload(&self) -> &str {
        &self.input_payload
    }

    pub fn output_payload(&self) -> &str {
        &self.output_payload
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn step_hash(&self) -> &str {
        &self.step_hash
    }

    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn model_identifier(&self) -> &str {
        &self.model_identifier
    }

    pub fn content(&self) -> StepContent<'_> {
        StepContent {
            stage_name: &self.stage_name,
            input_payload: &self.input_payload,
            output_payload: &self.output_payload,
            timestamp: &self.timestamp,
            confidence: self.confidence,
            model_identifier: &self.model_identifier,
        }
    }
}

impl Chained for ChainStep {
    fn prev_hash(&self) -> &str {
        &self.prev_hash
    }

    fn stored_hash(&self) -> &str {
        &self.step_hash
    }

    fn recompute_hash(&self) -> Result<String, VerdictError> {
        compute_step_hash(&self.content(), &self.prev_hash)
    }
}

/// Digest of the last record, or genesis for an empty chain.
pub fn head_hash<T: Chained>(items: &[T]) -> String {
    items
        .last()
        .map_or_else(|| GENESIS.to_string(), |i| i.stored_hash().to_string())
}
