//! Reconciler — repairs a lead whose persisted position drifted from the
//! ground truth of its send history.
//!
//! The target position is the first stage at or past the current one with
//! no `sent` record, so repair can never cause a re-send of mail that
//! already went out. Step never moves backwards (history rows can be
//! lost; progress is not).

use cadence_core::error::{CadenceError, Result};
use cadence_core::stage::Stage;
use cadence_core::state::{RepairResult, SequenceState};
use chrono::{DateTime, Duration, Utc};

use crate::engine::Engine;

impl Engine {
    /// Repair one lead. Idempotent; a consistent state is a no-op.
    pub fn reconcile_lead(&self, lead_id: &str) -> Result<RepairResult> {
        self.reconcile_lead_at(lead_id, Utc::now())
    }

    /// `reconcile_lead` with an explicit clock.
    pub fn reconcile_lead_at(&self, lead_id: &str, now: DateTime<Utc>) -> Result<RepairResult> {
        let mut state = self.store.claim(lead_id, now, self.stale_after(), false)?;
        let result = reconcile_state(&mut state, self.debounce(), now);
        self.store.release(&state)?;
        if let RepairResult::Corrected {
            from_step, to_step, ..
        } = &result
        {
            tracing::info!(
                "🔧 [{}] reconciled: step {} → {}",
                lead_id,
                from_step,
                to_step
            );
        }
        Ok(result)
    }

    /// Sweep every active lead. Leads claimed by a concurrent run are
    /// skipped; they will be consistent (or swept again) later.
    pub fn reconcile_all(&self) -> Result<Vec<(String, RepairResult)>> {
        self.reconcile_all_at(Utc::now())
    }

    pub fn reconcile_all_at(&self, now: DateTime<Utc>) -> Result<Vec<(String, RepairResult)>> {
        let mut results = Vec::new();
        for lead_id in self.store.active_leads()? {
            match self.reconcile_lead_at(&lead_id, now) {
                Ok(result) => results.push((lead_id, result)),
                Err(CadenceError::ClaimConflict) => continue,
                Err(e) => {
                    tracing::warn!("⚠️ [{}] reconcile failed: {}", lead_id, e);
                }
            }
        }
        Ok(results)
    }
}

/// First step at or past both the current step and the sent count whose
/// stage has no `sent` record. Past touch7 means "complete".
fn expected_position(state: &SequenceState) -> u32 {
    let mut step = (state.sent_count() as u32 + 1).max(state.step);
    while let Some(stage) = Stage::from_step(step) {
        if state.last_sent_for(stage).is_none() {
            break;
        }
        step += 1;
    }
    step
}

/// Pure repair of a claimed state. Mutates `state`; the caller persists.
pub(crate) fn reconcile_state(
    state: &mut SequenceState,
    debounce: Duration,
    now: DateTime<Utc>,
) -> RepairResult {
    let from_step = state.step;
    let target = expected_position(state);
    let stage_ok = match Stage::from_step(state.step) {
        Some(stage) => stage == state.stage,
        None => state.is_complete(),
    };
    let position_ok = target == state.step && stage_ok;
    let due_ok = !state.active || state.next_due_at.is_some();
    if position_ok && due_ok {
        return RepairResult::Noop;
    }

    if !position_ok {
        state.correct_position(target, now);
    }
    if state.active {
        // The corrected stage has no sent record within the debounce
        // window (or at all), so make it immediately due: the next
        // scheduler run catches the lead up.
        let recently_sent = state
            .last_sent_for(state.stage)
            .is_some_and(|r| now - r.attempted_at <= debounce);
        if !recently_sent {
            state.defer_until(now, now);
        }
    }

    RepairResult::Corrected {
        from_step,
        to_step: state.step,
        completed: state.is_complete(),
    }
}
