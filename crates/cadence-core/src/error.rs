//! Error taxonomy for the sequence engine.
//!
//! Per-lead failures are caught at the scheduler boundary and folded into a
//! `BatchResult`; they never abort the rest of a batch. `ClaimConflict` is
//! not really an error at all — it is how a concurrent run says "taken".

use crate::stage::Stage;
use thiserror::Error;

/// All errors produced by Cadence.
#[derive(Debug, Error)]
pub enum CadenceError {
    /// Invalid stage name or malformed lifecycle request. Rejected before
    /// any state mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced lead or sequence does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No active template for the due stage. Aborts only this lead's run.
    #[error("missing template for stage {stage} (account {account_id})")]
    TemplateMissing { account_id: String, stage: Stage },

    /// Mail send failed (network, auth, rate limit). Retryable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Another run already claimed this lead. A silent skip, not a failure.
    #[error("sequence already claimed by a concurrent run")]
    ClaimConflict,

    /// Persistence layer trouble.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration load/parse trouble.
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout Cadence.
pub type Result<T> = std::result::Result<T, CadenceError>;

impl CadenceError {
    /// True when the scheduler should count this as a skip rather than a
    /// failure.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, CadenceError::ClaimConflict)
    }
}
