//! Timing resolution — stage name + account timing rows → absolute due time.
//!
//! Pure functions; `now` is an input so callers (and tests) control the
//! clock.

use cadence_core::stage::Stage;
use cadence_core::types::TimingConfig;
use chrono::{DateTime, Duration, Utc};

/// Minimum delay before any stage becomes due. Prevents a zero-delay
/// config from racing the scheduler run that just wrote the state.
pub const FLOOR_SECS: i64 = 10;

/// Built-in fallback when an account has no timing row for a stage:
/// the first touch goes out immediately, every later touch waits a week.
pub fn default_delay(stage: Stage) -> Duration {
    match stage {
        Stage::Touch1 => Duration::zero(),
        _ => Duration::days(7),
    }
}

/// Absolute due time for `stage`, given the account's timing config.
/// Falls back to [`default_delay`] for unconfigured stages and never
/// returns a time closer than `now + FLOOR_SECS`.
pub fn resolve_next_due(stage: Stage, config: &TimingConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = config
        .for_stage(stage)
        .map(|e| e.delay_unit.to_duration(e.delay_amount))
        .unwrap_or_else(|| default_delay(stage));
    now + delay.max(Duration::seconds(FLOOR_SECS))
}
