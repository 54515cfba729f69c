//! Per-lead sequence state — the unit of mutual exclusion.
//!
//! Invariants enforced here rather than by callers:
//! - `step` only ever increases.
//! - `active == false ⇒ next_due_at == None`.
//! - past touch7 the state is inactive with `stopped_reason == "completed"`.
//! - at most one `sent` history record per stage.
//!
//! All mutation happens through [`SequenceState`] methods, invoked by the
//! stage executor and the reconciler while the record is claimed.

use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Sent,
    Failed,
}

/// One append-only history entry per attempted send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRecord {
    pub stage: Stage,
    pub attempted_at: DateTime<Utc>,
    pub status: SendStatus,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Which retry this attempt was (0 = first attempt at the stage).
    #[serde(default)]
    pub retry_of_count: u32,
}

/// Claim status of the record. Terminal states are expressed through
/// `active == false`, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Free for a scheduler run to claim.
    Idle,
    /// Exclusively held by one scheduler run.
    Claimed,
}

/// The per-lead persisted sequence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceState {
    pub lead_id: String,
    /// Automation toggle, independent of `active`.
    pub enabled: bool,
    /// True while a sequence is in flight.
    pub active: bool,
    pub stage: Stage,
    /// 1-based ordinal matching `stage`; `step > 7` denotes completion.
    pub step: u32,
    /// When the current stage is due. None iff inactive.
    pub next_due_at: Option<DateTime<Utc>>,
    /// Append-only send history, oldest first.
    pub history: Vec<SendRecord>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Why automation halted, when it has.
    pub stopped_reason: Option<String>,
    pub run_status: RunStatus,
    /// When the current claim was taken, for stale-claim recovery.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Token of the run holding the claim.
    pub claim_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reason string recorded on natural completion.
pub const REASON_COMPLETED: &str = "completed";

impl SequenceState {
    /// Start a fresh sequence at `stage`, due at `next_due_at`.
    pub fn start(
        lead_id: &str,
        stage: Stage,
        next_due_at: DateTime<Utc>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            lead_id: lead_id.to_string(),
            enabled: true,
            active: true,
            stage,
            step: stage.step(),
            next_due_at: Some(next_due_at),
            history: Vec::new(),
            retry_count: 0,
            max_retries,
            stopped_reason: None,
            run_status: RunStatus::Idle,
            claimed_at: None,
            claim_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the sequence walked past touch7.
    pub fn is_complete(&self) -> bool {
        self.step > Stage::LAST
    }

    /// Number of history entries with status `sent`.
    pub fn sent_count(&self) -> usize {
        self.history
            .iter()
            .filter(|r| r.status == SendStatus::Sent)
            .count()
    }

    /// The most recent `sent` record for a stage, if any.
    pub fn last_sent_for(&self, stage: Stage) -> Option<&SendRecord> {
        self.history
            .iter()
            .rev()
            .find(|r| r.stage == stage && r.status == SendStatus::Sent)
    }

    /// Record a successful send of the current stage and advance.
    ///
    /// `next_due_at` is the resolved due time for the *next* stage; it is
    /// ignored when this send completes the sequence. Returns the new
    /// current stage, or None on completion.
    pub fn record_sent(
        &mut self,
        message_id: Option<String>,
        now: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> Option<Stage> {
        debug_assert!(self.last_sent_for(self.stage).is_none());
        self.history.push(SendRecord {
            stage: self.stage,
            attempted_at: now,
            status: SendStatus::Sent,
            message_id,
            error: None,
            retry_of_count: self.retry_count,
        });
        self.retry_count = 0;
        self.step += 1;
        self.updated_at = now;
        match self.stage.next() {
            Some(next) => {
                self.stage = next;
                self.next_due_at = Some(next_due_at);
                Some(next)
            }
            None => {
                // Touch7 sent. step is now 8; stage keeps its last value.
                self.active = false;
                self.next_due_at = None;
                self.stopped_reason = Some(REASON_COMPLETED.into());
                None
            }
        }
    }

    /// Advance past the current stage without sending — the debounce
    /// backstop found a recent `sent` record for it, so the send already
    /// happened. Same bookkeeping as [`record_sent`](Self::record_sent)
    /// minus the history append.
    pub fn advance_without_send(
        &mut self,
        now: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> Option<Stage> {
        self.retry_count = 0;
        self.step += 1;
        self.updated_at = now;
        match self.stage.next() {
            Some(next) => {
                self.stage = next;
                self.next_due_at = Some(next_due_at);
                Some(next)
            }
            None => {
                self.active = false;
                self.next_due_at = None;
                self.stopped_reason = Some(REASON_COMPLETED.into());
                None
            }
        }
    }

    /// Record an attempt blocked before the transport (missing template,
    /// unresolvable account). Lands in history for the audit trail but
    /// does not consume the retry budget — it is an account-level outage,
    /// not a per-lead fault.
    pub fn record_blocked(&mut self, reason: &str, now: DateTime<Utc>) {
        self.history.push(SendRecord {
            stage: self.stage,
            attempted_at: now,
            status: SendStatus::Failed,
            message_id: None,
            error: Some(reason.to_string()),
            retry_of_count: self.retry_count,
        });
        self.updated_at = now;
    }

    /// Record a failed send attempt at the current stage. Does not decide
    /// retry vs terminal — that is the retry policy's call.
    pub fn record_failure(&mut self, error: &str, now: DateTime<Utc>) {
        self.history.push(SendRecord {
            stage: self.stage,
            attempted_at: now,
            status: SendStatus::Failed,
            message_id: None,
            error: Some(error.to_string()),
            retry_of_count: self.retry_count,
        });
        self.retry_count += 1;
        self.updated_at = now;
    }

    /// Re-arm the current stage for a later attempt (retry backoff, or a
    /// reconciler catch-up). Only valid while active.
    pub fn defer_until(&mut self, due: DateTime<Utc>, now: DateTime<Utc>) {
        debug_assert!(self.active);
        self.next_due_at = Some(due);
        self.updated_at = now;
    }

    /// Halt automation with a reason (terminal stop, retry exhaustion, or
    /// manual stop/pause).
    pub fn stop(&mut self, reason: &str, now: DateTime<Utc>) {
        self.active = false;
        self.next_due_at = None;
        self.stopped_reason = Some(reason.to_string());
        self.updated_at = now;
    }

    /// Reactivate a stopped sequence with a freshly resolved due time.
    /// Completed sequences cannot resume.
    pub fn resume(&mut self, next_due_at: DateTime<Utc>, now: DateTime<Utc>) {
        debug_assert!(!self.is_complete());
        self.active = true;
        self.stopped_reason = None;
        self.retry_count = 0;
        self.next_due_at = Some(next_due_at);
        self.updated_at = now;
    }

    /// Force step/stage to a reconciler-computed position. Completion is
    /// applied when the position walks past touch7. Never moves backwards.
    pub fn correct_position(&mut self, expected_step: u32, now: DateTime<Utc>) {
        debug_assert!(expected_step >= self.step);
        self.step = expected_step;
        if let Some(stage) = Stage::from_step(expected_step) {
            self.stage = stage;
        } else {
            self.active = false;
            self.next_due_at = None;
            self.stopped_reason = Some(REASON_COMPLETED.into());
        }
        self.updated_at = now;
    }
}

/// Aggregate outcome of one scheduler invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    /// Leads claimed and handed to the executor.
    pub processed: usize,
    /// Stage emails delivered.
    pub sent: usize,
    /// Leads whose attempt failed (retryable or terminal).
    pub failed: usize,
    /// Leads that finished touch7 this run.
    pub completed: usize,
    /// Leads skipped because a concurrent run held the claim.
    pub skipped: usize,
    /// Per-lead failure reasons, for the caller's summary.
    pub failures: Vec<BatchFailure>,
}

/// One lead's failure within a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub lead_id: String,
    pub reason: String,
}

/// Outcome of reconciling one lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairResult {
    /// State already matched its history.
    Noop,
    /// Step/stage were repaired from history.
    Corrected {
        from_step: u32,
        to_step: u32,
        completed: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(stage: Stage) -> SequenceState {
        let now = Utc::now();
        let mut s = SequenceState::start("lead-1", Stage::Touch1, now, 5, now);
        // Walk forward to the requested stage recording sends.
        while s.stage != stage {
            s.record_sent(Some("mid".into()), now, now);
        }
        s
    }

    #[test]
    fn test_advance_on_sent() {
        let now = Utc::now();
        let due = now + chrono::Duration::days(7);
        let mut s = SequenceState::start("l1", Stage::Touch1, now, 5, now);
        let next = s.record_sent(Some("msg-1".into()), now, due);
        assert_eq!(next, Some(Stage::Touch2));
        assert_eq!(s.step, 2);
        assert_eq!(s.next_due_at, Some(due));
        assert_eq!(s.retry_count, 0);
        assert_eq!(s.sent_count(), 1);
    }

    #[test]
    fn test_completion_at_touch7() {
        let now = Utc::now();
        let mut s = state_at(Stage::Touch7);
        let next = s.record_sent(Some("msg-7".into()), now, now);
        assert_eq!(next, None);
        assert!(s.is_complete());
        assert!(!s.active);
        assert_eq!(s.next_due_at, None);
        assert_eq!(s.stopped_reason.as_deref(), Some(REASON_COMPLETED));
        assert_eq!(s.sent_count(), 7);
    }

    #[test]
    fn test_failure_keeps_position() {
        let now = Utc::now();
        let mut s = state_at(Stage::Touch3);
        let step_before = s.step;
        s.record_failure("smtp 451", now);
        assert_eq!(s.step, step_before);
        assert_eq!(s.stage, Stage::Touch3);
        assert_eq!(s.retry_count, 1);
        assert!(s.active);
    }

    #[test]
    fn test_stop_clears_due() {
        let now = Utc::now();
        let mut s = state_at(Stage::Touch2);
        s.stop("manual stop", now);
        assert!(!s.active);
        assert_eq!(s.next_due_at, None);
        assert_eq!(s.stopped_reason.as_deref(), Some("manual stop"));

        s.resume(now, now);
        assert!(s.active);
        assert_eq!(s.stopped_reason, None);
        assert!(s.next_due_at.is_some());
    }

    #[test]
    fn test_step_monotonic_through_lifecycle() {
        let now = Utc::now();
        let mut s = SequenceState::start("l1", Stage::Touch1, now, 5, now);
        let mut last = s.step;
        for _ in 0..3 {
            s.record_failure("boom", now);
            assert!(s.step >= last);
            last = s.step;
            s.record_sent(None, now, now);
            assert!(s.step >= last);
            last = s.step;
        }
    }
}
