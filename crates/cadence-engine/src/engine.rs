//! The engine — wires the store, lead directory, templates, timing,
//! transport, and configuration behind one entry point.
//!
//! Every state mutation funnels through claim → mutate → release on the
//! sequence store. There is exactly one code path that sends stage mail:
//! [`Engine::execute_claimed`], used by both the scheduler sweep and
//! `force_advance`.

use std::sync::Arc;

use cadence_core::config::CadenceConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::state::SequenceState;
use cadence_core::traits::{
    LeadDirectory, MailTransport, SequenceStore, TemplateStore, TimingStore,
};
use chrono::{DateTime, Duration, Utc};

use crate::executor::{StageExecutor, StageOutcome};
use crate::retry::RetryPolicy;

/// The sequence engine. Cheap to clone — collaborators are shared.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn SequenceStore>,
    pub(crate) leads: Arc<dyn LeadDirectory>,
    pub(crate) templates: Arc<dyn TemplateStore>,
    pub(crate) timing: Arc<dyn TimingStore>,
    pub(crate) transport: Arc<dyn MailTransport>,
    pub(crate) config: CadenceConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        leads: Arc<dyn LeadDirectory>,
        templates: Arc<dyn TemplateStore>,
        timing: Arc<dyn TimingStore>,
        transport: Arc<dyn MailTransport>,
        config: CadenceConfig,
    ) -> Self {
        Self {
            store,
            leads,
            templates,
            timing,
            transport,
            config,
        }
    }

    /// Lease age past which a claim counts as abandoned.
    pub(crate) fn stale_after(&self) -> Duration {
        Duration::seconds(self.config.scheduler.stale_claim_secs as i64)
    }

    pub(crate) fn debounce(&self) -> Duration {
        Duration::seconds(self.config.scheduler.debounce_secs as i64)
    }

    fn executor(&self) -> StageExecutor<'_> {
        StageExecutor {
            templates: self.templates.as_ref(),
            transport: self.transport.as_ref(),
            policy: RetryPolicy::from_config(&self.config.scheduler),
            debounce: self.debounce(),
            send_timeout: std::time::Duration::from_secs(self.config.scheduler.send_timeout_secs),
            blocked_recheck: Duration::seconds(self.config.scheduler.retry_backoff_secs as i64),
        }
    }

    /// Run the stage executor against a claimed state. Resolution failures
    /// (lead gone, account unconfigured) block the lead the same way a
    /// missing template does: recorded, deferred, still active.
    pub(crate) async fn execute_claimed(
        &self,
        state: &mut SequenceState,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome> {
        let lead = match self.leads.lead(&state.lead_id) {
            Ok(lead) => lead,
            Err(CadenceError::NotFound(reason)) => return Ok(self.block(state, &reason, now)),
            Err(e) => return Err(e),
        };
        let account = match self.config.account(&lead.account_id) {
            Ok(a) => a.clone(),
            Err(CadenceError::NotFound(reason)) => return Ok(self.block(state, &reason, now)),
            Err(e) => return Err(e),
        };
        let timing = self.timing.timing_config(&lead.account_id)?;

        self.executor()
            .execute(state, &lead, &account, &timing, now)
            .await
    }

    fn block(&self, state: &mut SequenceState, reason: &str, now: DateTime<Utc>) -> StageOutcome {
        tracing::warn!("🚫 [{}] blocked: {}", state.lead_id, reason);
        state.record_blocked(reason, now);
        state.defer_until(
            now + Duration::seconds(self.config.scheduler.retry_backoff_secs as i64),
            now,
        );
        StageOutcome::Blocked {
            reason: reason.to_string(),
        }
    }
}
