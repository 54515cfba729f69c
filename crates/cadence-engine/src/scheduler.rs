//! The scheduler sweep — finds due leads, claims each, and drives the
//! stage executor.
//!
//! Invocation is external and at-least-once: cron may fire `run_once`
//! concurrently with itself or re-fire while a previous run is still in
//! flight. The store's claim CAS makes that safe; a lost claim is a
//! silent skip. One lead's failure never aborts the rest of the batch.

use cadence_core::error::{CadenceError, Result};
use cadence_core::state::{BatchFailure, BatchResult};
use chrono::{DateTime, Utc};

use crate::engine::Engine;
use crate::executor::StageOutcome;

impl Engine {
    /// Process everything currently due. Idempotent under repeated and
    /// concurrent invocation.
    pub async fn run_once(&self) -> Result<BatchResult> {
        self.run_once_at(Utc::now()).await
    }

    /// `run_once` with an explicit clock, for tests and catch-up runs.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<BatchResult> {
        let due = self.store.due(now, self.stale_after())?;
        let mut batch = BatchResult::default();
        if due.is_empty() {
            tracing::debug!("💤 no leads due");
            return Ok(batch);
        }
        tracing::info!("⏱️ {} lead(s) due", due.len());

        let pause = std::time::Duration::from_millis(self.config.scheduler.batch_delay_ms);
        for (i, lead_id) in due.iter().enumerate() {
            if i > 0 {
                // Courtesy gap between sends; outbound relays rate-limit.
                tokio::time::sleep(pause).await;
            }

            let mut state = match self.store.claim(lead_id, now, self.stale_after(), true) {
                Ok(state) => state,
                Err(CadenceError::ClaimConflict) => {
                    tracing::debug!("🤝 [{}] claimed by a concurrent run, skipping", lead_id);
                    batch.skipped += 1;
                    continue;
                }
                Err(e) => {
                    batch.failed += 1;
                    batch.failures.push(BatchFailure {
                        lead_id: lead_id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let outcome = self.execute_claimed(&mut state, now).await;
            if let Err(e) = self.store.release(&state) {
                tracing::error!("⚠️ [{}] release failed: {}", lead_id, e);
            }

            batch.processed += 1;
            match outcome {
                Ok(StageOutcome::Advanced(_)) => batch.sent += 1,
                Ok(StageOutcome::Completed) => {
                    batch.sent += 1;
                    batch.completed += 1;
                }
                Ok(StageOutcome::AlreadySent(next)) => {
                    if next.is_none() {
                        batch.completed += 1;
                    }
                }
                Ok(StageOutcome::Retried { error, .. })
                | Ok(StageOutcome::Terminal { error }) => {
                    batch.failed += 1;
                    batch.failures.push(BatchFailure {
                        lead_id: lead_id.clone(),
                        reason: error,
                    });
                }
                Ok(StageOutcome::Blocked { reason }) => {
                    batch.failed += 1;
                    batch.failures.push(BatchFailure {
                        lead_id: lead_id.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    batch.failed += 1;
                    batch.failures.push(BatchFailure {
                        lead_id: lead_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "📊 batch done: {} processed, {} sent, {} failed, {} completed, {} skipped",
            batch.processed,
            batch.sent,
            batch.failed,
            batch.completed,
            batch.skipped
        );
        Ok(batch)
    }

    /// Periodic trigger loop for deployments without an external cron:
    /// runs `run_once` every `every_secs`, forever.
    pub async fn run_loop(&self, every_secs: u64) {
        tracing::info!("⏰ scheduler loop started (every {}s)", every_secs);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(every_secs));
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                tracing::error!("⚠️ scheduler run failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::FLOOR_SECS;
    use async_trait::async_trait;
    use cadence_core::config::CadenceConfig;
    use cadence_core::stage::Stage;
    use cadence_core::state::{RunStatus, SendStatus};
    use cadence_core::traits::{MailTransport, SequenceStore};
    use cadence_core::types::{Lead, OutboundEmail, SendReceipt, SmtpAccount, Template};
    use cadence_store::SequenceDb;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every send; optionally fails or dawdles.
    struct FakeTransport {
        sent: Mutex<Vec<OutboundEmail>>,
        fail: bool,
        delay_ms: u64,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: false,
                delay_ms: 0,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
                delay_ms: 0,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: false,
                delay_ms,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MailTransport for FakeTransport {
        async fn send(
            &self,
            email: &OutboundEmail,
            _account: &SmtpAccount,
        ) -> cadence_core::Result<SendReceipt> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(CadenceError::Transport("smtp 451 try later".into()));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(SendReceipt {
                message_id: format!("<msg-{n}@test>"),
            })
        }
    }

    fn test_config() -> CadenceConfig {
        let mut config = CadenceConfig::default();
        config.scheduler.batch_delay_ms = 0;
        config.scheduler.max_retries = 2;
        config.accounts.insert("acme".into(), SmtpAccount::default());
        config
    }

    fn seed_db(db: &SequenceDb, stages_with_templates: &[Stage]) {
        db.upsert_lead(&Lead {
            id: "l1".into(),
            account_id: "acme".into(),
            email: "jo@prospect.test".into(),
            first_name: Some("Jo".into()),
            last_name: None,
            company: Some("Prospect Co".into()),
        })
        .unwrap();
        for stage in stages_with_templates {
            db.upsert_template(
                "acme",
                *stage,
                &Template {
                    subject: format!("{stage}: hi {{{{first_name}}}}"),
                    html_body: "<p>Hello {{first_name}}</p>".into(),
                    text_body: "Hello {{first_name}}".into(),
                },
            )
            .unwrap();
        }
    }

    fn engine(db: &Arc<SequenceDb>, transport: Arc<FakeTransport>) -> Engine {
        Engine::new(
            db.clone(),
            db.clone(),
            db.clone(),
            db.clone(),
            transport,
            test_config(),
        )
    }

    #[tokio::test]
    async fn test_due_stage_sent_and_advanced() {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        seed_db(&db, &Stage::ALL);
        let transport = FakeTransport::ok();
        let eng = engine(&db, transport.clone());

        eng.start_sequence("l1", Stage::Touch1).unwrap();
        // Anchor the test clock to the store-roundtripped (ms-aligned)
        // timestamp so equality checks survive the store's ms precision.
        let started = SequenceStore::get(db.as_ref(), "l1").unwrap().created_at;

        // Not due before the floor elapses
        let early = eng.run_once_at(started).await.unwrap();
        assert_eq!(early.processed, 0);

        // Due after the floor: touch1 goes out, touch2 scheduled a week out
        let later = started + Duration::seconds(FLOOR_SECS);
        let batch = eng.run_once_at(later).await.unwrap();
        assert_eq!(batch.sent, 1);
        assert_eq!(batch.failed, 0);

        let state = SequenceStore::get(db.as_ref(), "l1").unwrap();
        assert_eq!(state.step, 2);
        assert_eq!(state.stage, Stage::Touch2);
        assert_eq!(state.next_due_at, Some(later + Duration::days(7)));
        assert_eq!(state.run_status, RunStatus::Idle);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "touch1: hi Jo");
        assert_eq!(sent[0].to, "jo@prospect.test");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_runs_send_at_most_once() {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        seed_db(&db, &Stage::ALL);
        let transport = FakeTransport::slow(100);
        let eng_a = engine(&db, transport.clone());
        let eng_b = engine(&db, transport.clone());

        let state = eng_a.start_sequence("l1", Stage::Touch1).unwrap();
        let due = state.created_at + Duration::seconds(FLOOR_SECS);

        // Two overlapping invocations of the same sweep
        let (a, b) = tokio::join!(eng_a.run_once_at(due), eng_b.run_once_at(due));
        let (a, b) = (a.unwrap(), b.unwrap());

        // Exactly one run sent; the loser either lost the claim or found
        // nothing left to do.
        assert_eq!(a.sent + b.sent, 1);
        assert!(a.skipped + b.skipped <= 1);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);

        let state = SequenceStore::get(db.as_ref(), "l1").unwrap();
        assert_eq!(state.step, 2);
        assert_eq!(
            state
                .history
                .iter()
                .filter(|r| r.stage == Stage::Touch1 && r.status == SendStatus::Sent)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_retry_then_exhaustion() {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        seed_db(&db, &Stage::ALL);
        let transport = FakeTransport::failing();
        let eng = engine(&db, transport.clone()); // max_retries = 2

        eng.start_sequence("l1", Stage::Touch1).unwrap();
        // ms-aligned anchor; see test_due_stage_sent_and_advanced.
        let started = SequenceStore::get(db.as_ref(), "l1").unwrap().created_at;
        let mut now = started + Duration::seconds(FLOOR_SECS);

        // First failure: retry scheduled, still active
        let batch = eng.run_once_at(now).await.unwrap();
        assert_eq!(batch.failed, 1);
        let state = SequenceStore::get(db.as_ref(), "l1").unwrap();
        assert!(state.active);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.step, 1);
        assert_eq!(state.next_due_at, Some(now + Duration::minutes(10)));

        // Second failure: retries exhausted, terminal
        now += Duration::minutes(10);
        let batch = eng.run_once_at(now).await.unwrap();
        assert_eq!(batch.failed, 1);
        let state = SequenceStore::get(db.as_ref(), "l1").unwrap();
        assert!(!state.active);
        assert_eq!(state.next_due_at, None);
        assert!(
            state
                .stopped_reason
                .as_deref()
                .unwrap()
                .starts_with("max retries exceeded:")
        );

        // Terminal leads never show up as due again
        now += Duration::minutes(10);
        assert!(db.due(now, Duration::minutes(10)).unwrap().is_empty());
        let batch = eng.run_once_at(now).await.unwrap();
        assert_eq!(batch.processed, 0);
    }

    #[tokio::test]
    async fn test_missing_template_blocks_without_advancing() {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        seed_db(&db, &[]); // no templates published
        // Make touch5 immediately due instead of the 7-day default
        db.set_timing(
            "acme",
            &cadence_core::types::TimingEntry {
                stage: Stage::Touch5,
                delay_amount: 0,
                delay_unit: cadence_core::types::DelayUnit::Minutes,
            },
        )
        .unwrap();
        let transport = FakeTransport::ok();
        let eng = engine(&db, transport.clone());

        let state = eng.start_sequence("l1", Stage::Touch5).unwrap();
        let now = state.created_at + Duration::seconds(FLOOR_SECS);

        let batch = eng.run_once_at(now).await.unwrap();
        assert_eq!(batch.failed, 1);
        assert!(batch.failures[0].reason.contains("missing template"));
        assert!(batch.failures[0].reason.contains("touch5"));

        let state = SequenceStore::get(db.as_ref(), "l1").unwrap();
        assert!(state.active, "lead stays eligible for retry");
        assert_eq!(state.step, 5);
        assert_eq!(state.stage, Stage::Touch5);
        assert_eq!(state.retry_count, 0, "blocked runs don't burn retries");
        assert!(transport.sent.lock().unwrap().is_empty());

        // Publish the template; the next run catches up
        seed_db(&db, &[Stage::Touch5]);
        let now = now + Duration::minutes(10);
        let batch = eng.run_once_at(now).await.unwrap();
        assert_eq!(batch.sent, 1);
        assert_eq!(SequenceStore::get(db.as_ref(), "l1").unwrap().step, 6);
    }

    #[tokio::test]
    async fn test_completion_at_touch7() {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        seed_db(&db, &Stage::ALL);
        db.set_timing(
            "acme",
            &cadence_core::types::TimingEntry {
                stage: Stage::Touch7,
                delay_amount: 0,
                delay_unit: cadence_core::types::DelayUnit::Minutes,
            },
        )
        .unwrap();
        let transport = FakeTransport::ok();
        let eng = engine(&db, transport.clone());

        let state = eng.start_sequence("l1", Stage::Touch7).unwrap();
        let now = state.created_at + Duration::seconds(FLOOR_SECS);

        let batch = eng.run_once_at(now).await.unwrap();
        assert_eq!(batch.sent, 1);
        assert_eq!(batch.completed, 1);

        let state = SequenceStore::get(db.as_ref(), "l1").unwrap();
        assert!(state.is_complete());
        assert!(!state.active);
        assert_eq!(state.next_due_at, None);
        assert_eq!(state.stopped_reason.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn test_debounce_advances_without_resending() {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        seed_db(&db, &Stage::ALL);
        let transport = FakeTransport::ok();
        let eng = engine(&db, transport.clone());

        let state = eng.start_sequence("l1", Stage::Touch1).unwrap();
        let now = state.created_at + Duration::seconds(FLOOR_SECS);

        // Simulate a crashed run that recorded the send but not the
        // advancement: sent record present, step still 1, due now.
        let mut state = db.claim("l1", now, eng.stale_after(), true).unwrap();
        state.history.push(cadence_core::state::SendRecord {
            stage: Stage::Touch1,
            attempted_at: now - Duration::minutes(5),
            status: SendStatus::Sent,
            message_id: Some("<orphan@test>".into()),
            error: None,
            retry_of_count: 0,
        });
        db.release(&state).unwrap();

        let batch = eng.run_once_at(now).await.unwrap();
        assert_eq!(batch.processed, 1);
        assert_eq!(batch.sent, 0, "no second send for touch1");
        assert!(transport.sent.lock().unwrap().is_empty());

        let state = SequenceStore::get(db.as_ref(), "l1").unwrap();
        assert_eq!(state.step, 2);
        assert_eq!(state.stage, Stage::Touch2);
    }

    #[tokio::test]
    async fn test_step_never_decreases_across_runs() {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        seed_db(&db, &Stage::ALL);
        let transport = FakeTransport::ok();
        let eng = engine(&db, transport.clone());

        let state = eng.start_sequence("l1", Stage::Touch1).unwrap();
        let mut now = state.created_at;
        let mut last_step = 1;
        for _ in 0..7 {
            now += Duration::days(8);
            eng.run_once_at(now).await.unwrap();
            let step = SequenceStore::get(db.as_ref(), "l1").unwrap().step;
            assert!(step >= last_step);
            last_step = step;
        }
        assert_eq!(last_step, 8);
        assert_eq!(transport.sent.lock().unwrap().len(), 7);
    }
}
