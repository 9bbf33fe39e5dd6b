//! Core modules: hashing, the pipeline, the ledger and their storage plumbing.
//!
//! Leaf modules first: `canonical` and `chain` know nothing about stages or
//! storage; `ledger` reaches SQLite only through `broker` and `pool`.

pub mod broker;
pub mod canonical;
pub mod case_ref;
pub mod chain;
pub mod confidence;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod ledger;
pub mod pipeline;
pub mod pool;
pub mod redact;
pub mod router;
pub mod schemas;
pub mod signoff;
pub mod stage;
pub mod store;
pub mod time;
