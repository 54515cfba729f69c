//! Collaborator seams consumed by the engine.
//!
//! The store traits are synchronous (SQLite behind a mutex, per the
//! persistence crate); only the mail transport is async.

use crate::error::Result;
use crate::stage::Stage;
use crate::state::SequenceState;
use crate::types::{Lead, OutboundEmail, SendReceipt, SmtpAccount, Template, TimingConfig};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Outbound mail delivery.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver one email using the account's credentials. Errors map to
    /// `CadenceError::Transport` and are retryable.
    async fn send(&self, email: &OutboundEmail, account: &SmtpAccount) -> Result<SendReceipt>;
}

/// Stage email templates, per account.
pub trait TemplateStore: Send + Sync {
    /// The active template for a stage, or None when nothing is published.
    fn active_template(&self, account_id: &str, stage: Stage) -> Result<Option<Template>>;
}

/// Per-account stage timing.
pub trait TimingStore: Send + Sync {
    /// Timing rows for an account; may be empty (defaults apply).
    fn timing_config(&self, account_id: &str) -> Result<TimingConfig>;
}

/// Lead lookup. CRUD lives outside the engine.
pub trait LeadDirectory: Send + Sync {
    /// Fetch one lead; `NotFound` when it does not exist.
    fn lead(&self, lead_id: &str) -> Result<Lead>;
}

/// Sequence-state persistence with the atomic claim primitive.
///
/// `claim` is the single mutual-exclusion mechanism: a conditional update
/// that succeeds for exactly one caller. Everything that mutates a state
/// record goes claim → mutate → release.
pub trait SequenceStore: Send + Sync {
    /// Insert a fresh state; `Validation` error if one already exists.
    fn insert(&self, state: &SequenceState) -> Result<()>;

    /// Point read; `NotFound` when absent.
    fn get(&self, lead_id: &str) -> Result<SequenceState>;

    /// Lead ids that are active, unclaimed (or stale-claimed), and due at
    /// `now`. `stale_after` is the lease age past which a claim counts as
    /// abandoned.
    fn due(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<Vec<String>>;

    /// Atomically claim one lead's state for exclusive processing.
    /// Returns the claimed snapshot, or `ClaimConflict` if another run
    /// holds a fresh claim or the record is no longer claimable.
    ///
    /// With `due_only` the claim additionally requires `next_due_at <= now`,
    /// so a record another run just advanced cannot be re-claimed in the
    /// same sweep. Lifecycle operations pass `false`.
    fn claim(
        &self,
        lead_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
        due_only: bool,
    ) -> Result<SequenceState>;

    /// Persist a mutated state and release its claim.
    fn release(&self, state: &SequenceState) -> Result<()>;

    /// All lead ids with `active == true`, for reconciliation sweeps.
    fn active_leads(&self) -> Result<Vec<String>>;
}
