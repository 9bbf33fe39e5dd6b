//! Human approval of a decision.
//!
//! The note itself never reaches the ledger; only its digest and a signature
//! digest binding it to the approver and the moment of approval.

use crate::core::canonical::CanonicalRecord;
use crate::core::chain::{hash_record, sha256_hex};
use crate::core::error::VerdictError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignOffMethod {
    Pin,
    Biometric,
    Certificate,
}

impl SignOffMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            SignOffMethod::Pin => "pin",
            SignOffMethod::Biometric => "biometric",
            SignOffMethod::Certificate => "certificate",
        }
    }
}

impl fmt::Display for SignOffMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignOffMethod {
    type Err = VerdictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pin" => Ok(SignOffMethod::Pin),
            "biometric" => Ok(SignOffMethod::Biometric),
            "certificate" => Ok(SignOffMethod::Certificate),
            other => Err(VerdictError::ValidationError(format!(
                "unknown sign-off method '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignOff {
    pub actor: String,
    pub signed_at: String,
    pub method: SignOffMethod,
    pub note_hash: String,
    pub signature_hash: String,
}

impl SignOff {
    pub fn approve(actor: &str, note: &str, method: SignOffMethod) -> Result<Self, VerdictError> {
        Self::approve_at(actor, note, method, &time::now_iso8601())
    }

    /// Like [`SignOff::approve`] with an explicit timestamp.
    pub fn approve_at(
        actor: &str,
        note: &str,
        method: SignOffMethod,
        signed_at: &str,
    ) -> Result<Self, VerdictError> {
        if actor.trim().is_empty() {
            return Err(VerdictError::ValidationError(
                "sign-off requires an actor".to_string(),
            ));
        }
        let note_hash = sha256_hex(note.as_bytes());
        let signature_hash = signature_digest(&note_hash, actor, signed_at, method)?;
        Ok(Self {
            actor: actor.to_string(),
            signed_at: signed_at.to_string(),
            method,
            note_hash,
            signature_hash,
        })
    }

    /// True when `note` is the approved note and no signature field was altered.
    pub fn verify(&self, note: &str) -> bool {
        if sha256_hex(note.as_bytes()) != self.note_hash {
            return false;
        }
        self.is_self_consistent()
    }

    /// Signature digest matches the stored fields; does not need the note.
    pub fn is_self_consistent(&self) -> bool {
        signature_digest(&self.note_hash, &self.actor, &self.signed_at, self.method)
            .map(|h| h == self.signature_hash)
            .unwrap_or(false)
    }
}

fn signature_digest(
    note_hash: &str,
    actor: &str,
    signed_at: &str,
    method: SignOffMethod,
) -> Result<String, VerdictError> {
    hash_record(
        &CanonicalRecord::new()
            .text("note_hash", note_hash)
            .text("actor", actor)
            .text("signed_at", signed_at)
            .text("method", method.as_str()),
    )
}
