//! Sequence lifecycle operations: start, stop, pause, resume, and
//! force-advance.
//!
//! Every mutation goes through the store's claim, including
//! `force_advance` — there is no unguarded path around the scheduler's
//! locking.

use cadence_core::error::{CadenceError, Result};
use cadence_core::stage::Stage;
use cadence_core::state::SequenceState;
use chrono::Utc;

use crate::engine::Engine;
use crate::executor::StageOutcome;
use crate::timing::resolve_next_due;

/// Reason recorded by `pause_sequence`.
pub const REASON_PAUSED: &str = "paused";

impl Engine {
    /// Start automation for a lead at `stage`. The first due time comes
    /// from the account's timing config (or the default table).
    pub fn start_sequence(&self, lead_id: &str, stage: Stage) -> Result<SequenceState> {
        let lead = self.leads.lead(lead_id)?;
        let timing = self.timing.timing_config(&lead.account_id)?;
        let now = Utc::now();
        let due = resolve_next_due(stage, &timing, now);
        let state = SequenceState::start(
            lead_id,
            stage,
            due,
            self.config.scheduler.max_retries,
            now,
        );
        self.store.insert(&state)?;
        tracing::info!("▶️ [{}] sequence started at {} (due {})", lead_id, stage, due);
        Ok(state)
    }

    /// Halt automation with a reason. Takes effect immediately; a send
    /// already dispatched by a concurrent run still completes.
    pub fn stop_sequence(&self, lead_id: &str, reason: &str) -> Result<()> {
        let now = Utc::now();
        let mut state = self.store.claim(lead_id, now, self.stale_after(), false)?;
        if state.is_complete() {
            self.store.release(&state)?;
            return Err(CadenceError::Validation(format!(
                "sequence for lead '{lead_id}' already completed"
            )));
        }
        state.stop(reason, now);
        self.store.release(&state)?;
        tracing::info!("⏹️ [{}] sequence stopped: {}", lead_id, reason);
        Ok(())
    }

    /// Pause automation (a stop with a well-known reason, resumable).
    pub fn pause_sequence(&self, lead_id: &str) -> Result<()> {
        self.stop_sequence(lead_id, REASON_PAUSED)
    }

    /// Reactivate a stopped sequence; the current stage gets a freshly
    /// resolved due time.
    pub fn resume_sequence(&self, lead_id: &str) -> Result<SequenceState> {
        let now = Utc::now();
        let mut state = self.store.claim(lead_id, now, self.stale_after(), false)?;
        let result = (|| {
            if state.is_complete() {
                return Err(CadenceError::Validation(format!(
                    "sequence for lead '{lead_id}' already completed"
                )));
            }
            let lead = self.leads.lead(lead_id)?;
            let timing = self.timing.timing_config(&lead.account_id)?;
            let due = resolve_next_due(state.stage, &timing, now);
            state.resume(due, now);
            Ok(())
        })();
        self.store.release(&state)?;
        result?;
        tracing::info!(
            "⏯️ [{}] sequence resumed at {} (due {:?})",
            lead_id,
            state.stage,
            state.next_due_at
        );
        Ok(state)
    }

    /// Process the lead's current stage right now, ignoring `next_due_at`.
    /// Funnels through the same claim and executor path as the scheduler,
    /// so the idempotency guard and retry accounting still apply.
    pub async fn force_advance(&self, lead_id: &str) -> Result<StageOutcome> {
        let now = Utc::now();
        let mut state = self.store.claim(lead_id, now, self.stale_after(), false)?;
        if !state.active || state.is_complete() {
            self.store.release(&state)?;
            return Err(CadenceError::Validation(format!(
                "sequence for lead '{lead_id}' is not active"
            )));
        }
        let outcome = self.execute_claimed(&mut state, now).await;
        self.store.release(&state)?;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::config::CadenceConfig;
    use cadence_core::state::RunStatus;
    use cadence_core::traits::{MailTransport, SequenceStore};
    use cadence_core::types::{Lead, OutboundEmail, SendReceipt, SmtpAccount, Template};
    use cadence_store::SequenceDb;
    use std::sync::{Arc, Mutex};

    struct OkTransport {
        sent: Mutex<Vec<OutboundEmail>>,
    }

    #[async_trait]
    impl MailTransport for OkTransport {
        async fn send(
            &self,
            email: &OutboundEmail,
            _account: &SmtpAccount,
        ) -> cadence_core::Result<SendReceipt> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(SendReceipt {
                message_id: "<forced@test>".into(),
            })
        }
    }

    fn setup() -> (Arc<SequenceDb>, Arc<OkTransport>, Engine) {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        db.upsert_lead(&Lead {
            id: "l1".into(),
            account_id: "acme".into(),
            email: "jo@prospect.test".into(),
            first_name: Some("Jo".into()),
            last_name: None,
            company: None,
        })
        .unwrap();
        for stage in Stage::ALL {
            db.upsert_template(
                "acme",
                stage,
                &Template {
                    subject: format!("{stage}"),
                    html_body: "<p>hi</p>".into(),
                    text_body: "hi".into(),
                },
            )
            .unwrap();
        }
        let transport = Arc::new(OkTransport {
            sent: Mutex::new(Vec::new()),
        });
        let mut config = CadenceConfig::default();
        config.accounts.insert("acme".into(), SmtpAccount::default());
        let eng = Engine::new(
            db.clone(),
            db.clone(),
            db.clone(),
            db.clone(),
            transport.clone(),
            config,
        );
        (db, transport, eng)
    }

    #[test]
    fn test_start_requires_known_lead() {
        let (_db, _t, eng) = setup();
        assert!(matches!(
            eng.start_sequence("ghost", Stage::Touch1),
            Err(CadenceError::NotFound(_))
        ));
        let state = eng.start_sequence("l1", Stage::Touch1).unwrap();
        assert_eq!(state.step, 1);
        // Starting twice is rejected
        assert!(matches!(
            eng.start_sequence("l1", Stage::Touch1),
            Err(CadenceError::Validation(_))
        ));
    }

    #[test]
    fn test_pause_resume_cycle() {
        let (db, _t, eng) = setup();
        eng.start_sequence("l1", Stage::Touch3).unwrap();

        eng.pause_sequence("l1").unwrap();
        let state = SequenceStore::get(db.as_ref(), "l1").unwrap();
        assert!(!state.active);
        assert_eq!(state.next_due_at, None);
        assert_eq!(state.stopped_reason.as_deref(), Some(REASON_PAUSED));
        assert_eq!(state.run_status, RunStatus::Idle);

        let state = eng.resume_sequence("l1").unwrap();
        assert!(state.active);
        assert_eq!(state.stage, Stage::Touch3);
        assert!(state.next_due_at.is_some());
        assert_eq!(state.stopped_reason, None);
    }

    #[tokio::test]
    async fn test_force_advance_sends_immediately() {
        let (db, transport, eng) = setup();
        eng.start_sequence("l1", Stage::Touch2).unwrap();
        // touch2 defaults to a 7-day delay; force_advance ignores it
        let outcome = eng.force_advance("l1").await.unwrap();
        assert_eq!(outcome, StageOutcome::Advanced(Stage::Touch3));
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(SequenceStore::get(db.as_ref(), "l1").unwrap().step, 3);
    }

    #[tokio::test]
    async fn test_force_advance_rejects_stopped() {
        let (_db, _t, eng) = setup();
        eng.start_sequence("l1", Stage::Touch1).unwrap();
        eng.stop_sequence("l1", "manual stop").unwrap();
        assert!(matches!(
            eng.force_advance("l1").await,
            Err(CadenceError::Validation(_))
        ));
    }
}
