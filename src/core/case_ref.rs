//! Pseudonymous case references.
//!
//! Raw identifiers (record numbers and the like) are replaced with a salted
//! digest before anything is persisted. The ledger accepts only references of
//! this shape.

use crate::core::chain::sha256_hex;
use crate::core::error::VerdictError;

pub const CASE_REF_PREFIX: &str = "case-";
const CASE_REF_HEX_LEN: usize = 32;

/// `case-` followed by the first 32 hex digits of SHA-256(salt ‖ 0x00 ‖ identifier).
pub fn pseudonymize(raw_identifier: &str, salt: &str) -> Result<String, VerdictError> {
    if raw_identifier.trim().is_empty() {
        return Err(VerdictError::ValidationError(
            "cannot pseudonymize an empty identifier".to_string(),
        ));
    }
    if salt.is_empty() {
        return Err(VerdictError::ValidationError(
            "pseudonymization salt must not be empty".to_string(),
        ));
    }
    let mut material = Vec::with_capacity(salt.len() + 1 + raw_identifier.len());
    material.extend_from_slice(salt.as_bytes());
    material.push(0);
    material.extend_from_slice(raw_identifier.as_bytes());
    let digest = sha256_hex(&material);
    Ok(format!("{}{}", CASE_REF_PREFIX, &digest[..CASE_REF_HEX_LEN]))
}

pub fn is_opaque(reference: &str) -> bool {
    reference
        .strip_prefix(CASE_REF_PREFIX)
        .is_some_and(|hex| {
            hex.len() == CASE_REF_HEX_LEN
                && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        })
}

pub fn require_opaque(reference: &str) -> Result<(), VerdictError> {
    if is_opaque(reference) {
        Ok(())
    } else {
        Err(VerdictError::ValidationError(format!(
            "case reference '{}' is not a pseudonym; use `verdict case-ref`",
            reference
        )))
    }
}
