//! Stage executor — sends exactly one due stage email for a claimed lead
//! and computes the next state.
//!
//! The caller holds the claim; nothing here touches the store. The
//! debounce guard is a defensive backstop on top of the claim, not the
//! locking mechanism.

use cadence_core::error::{CadenceError, Result};
use cadence_core::stage::Stage;
use cadence_core::state::SequenceState;
use cadence_core::traits::{MailTransport, TemplateStore};
use cadence_core::types::{Lead, SmtpAccount, TimingConfig};
use cadence_mail::render_email;
use chrono::{DateTime, Duration, Utc};

use crate::retry::{RetryDecision, RetryPolicy};
use crate::timing::resolve_next_due;

/// What happened to one claimed lead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage sent; sequence advanced to the given stage.
    Advanced(Stage),
    /// Touch7 sent; sequence complete.
    Completed,
    /// Debounce backstop: the stage was already sent recently, state
    /// advanced without a new send. None means that advance completed
    /// the sequence.
    AlreadySent(Option<Stage>),
    /// Send failed; same stage re-armed for a later attempt.
    Retried { error: String, retry_at: DateTime<Utc> },
    /// Retries exhausted; sequence is terminal.
    Terminal { error: String },
    /// Aborted before the transport (e.g. missing template). Stage and
    /// step untouched; the lead stays active and eligible.
    Blocked { reason: String },
}

/// Executes one due stage for one claimed lead.
pub struct StageExecutor<'a> {
    pub templates: &'a dyn TemplateStore,
    pub transport: &'a dyn MailTransport,
    pub policy: RetryPolicy,
    /// Window inside which an existing `sent` record means "skip the send".
    pub debounce: Duration,
    /// Upper bound on one transport call.
    pub send_timeout: std::time::Duration,
    /// Re-check interval after a blocked attempt.
    pub blocked_recheck: Duration,
}

impl StageExecutor<'_> {
    /// Process the claimed `state`: idempotency guard, template lookup,
    /// send, and state transition. Mutates `state`; the caller persists
    /// it on release.
    pub async fn execute(
        &self,
        state: &mut SequenceState,
        lead: &Lead,
        account: &SmtpAccount,
        timing: &TimingConfig,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome> {
        debug_assert!(state.active && !state.is_complete());
        let stage = state.stage;

        // Idempotency backstop: a recent sent record for this stage means
        // some earlier run got the mail out but lost the state update.
        if let Some(record) = state.last_sent_for(stage)
            && now - record.attempted_at <= self.debounce
        {
            tracing::warn!(
                "⏭️ [{}] {} already sent {}, advancing without send",
                state.lead_id,
                stage,
                record.attempted_at
            );
            let next_due = self.due_for_next(stage, timing, now);
            return Ok(StageOutcome::AlreadySent(
                state.advance_without_send(now, next_due),
            ));
        }

        let Some(template) = self.templates.active_template(&lead.account_id, stage)? else {
            let err = CadenceError::TemplateMissing {
                account_id: lead.account_id.clone(),
                stage,
            };
            let reason = err.to_string();
            tracing::warn!("🚫 [{}] {}", state.lead_id, reason);
            state.record_blocked(&reason, now);
            // Re-check later without burning the retry budget.
            state.defer_until(now + self.blocked_recheck, now);
            return Ok(StageOutcome::Blocked { reason });
        };

        let email = render_email(&template, lead);
        let sent = match tokio::time::timeout(self.send_timeout, self.transport.send(&email, account))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CadenceError::Transport(format!(
                "send timed out after {:?}",
                self.send_timeout
            ))),
        };

        match sent {
            Ok(receipt) => {
                let next_due = self.due_for_next(stage, timing, now);
                match state.record_sent(Some(receipt.message_id), now, next_due) {
                    Some(next) => {
                        tracing::info!(
                            "📬 [{}] {} sent, next {} at {}",
                            state.lead_id,
                            stage,
                            next,
                            next_due
                        );
                        Ok(StageOutcome::Advanced(next))
                    }
                    None => {
                        tracing::info!("🏁 [{}] {} sent, sequence complete", state.lead_id, stage);
                        Ok(StageOutcome::Completed)
                    }
                }
            }
            Err(CadenceError::Transport(error)) => {
                state.record_failure(&error, now);
                match self.policy.on_failure(state.retry_count, state.max_retries, now) {
                    RetryDecision::RetryAt(retry_at) => {
                        state.defer_until(retry_at, now);
                        tracing::warn!(
                            "🔁 [{}] {} failed (attempt {}/{}), retry at {}: {}",
                            state.lead_id,
                            stage,
                            state.retry_count,
                            state.max_retries,
                            retry_at,
                            error
                        );
                        Ok(StageOutcome::Retried { error, retry_at })
                    }
                    RetryDecision::Terminal => {
                        let reason = format!("max retries exceeded: {error}");
                        state.stop(&reason, now);
                        tracing::error!("⛔ [{}] {} terminal: {}", state.lead_id, stage, reason);
                        Ok(StageOutcome::Terminal { error })
                    }
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Due time for the stage after `stage`. Meaningless (and unused) when
    /// `stage` is touch7.
    fn due_for_next(&self, stage: Stage, timing: &TimingConfig, now: DateTime<Utc>) -> DateTime<Utc> {
        match stage.next() {
            Some(next) => resolve_next_due(next, timing, now),
            None => now,
        }
    }
}
