//! On-disk location of a ledger and its journal.

use crate::core::error::VerdictError;
use std::fs;
use std::path::{Path, PathBuf};

/// Default store directory, relative to the working directory.
pub const DEFAULT_STORE_DIR: &str = ".verdict";

/// Store handle: a directory holding `ledger.db` and `ledger.events.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    /// Absolute or caller-relative path to the store root directory
    pub root: PathBuf,
}

impl Store {
    /// Create the store directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, VerdictError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Handle to an existing store; fails if the directory is missing.
    pub fn existing(root: impl AsRef<Path>) -> Result<Self, VerdictError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(VerdictError::NotFound(format!(
                "store directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self { root })
    }
}
