//! # Cadence Engine
//!
//! The sequence scheduler and state machine: decides, for every lead under
//! active automation, whether a stage email is due, executes exactly one
//! send per due stage, advances or retries state, and repairs leads whose
//! counters drifted from their send history.
//!
//! ## Correctness model
//! The external trigger is at-least-once — `run_once` may fire
//! concurrently with itself. Safety comes from the store's claim: an
//! atomic conditional update that grants exclusive processing rights over
//! one lead to one run. Everything that mutates sequence state (the
//! scheduler sweep, lifecycle operations, force-advance, the reconciler)
//! goes claim → mutate → release.
//!
//! ```text
//! trigger ──▶ Engine::run_once
//!               ├── store.due(now)               find candidates
//!               ├── store.claim(lead)            CAS, losers skip
//!               ├── StageExecutor::execute       debounce guard → template
//!               │     └── MailTransport::send    → render → bounded send
//!               └── store.release(state)         persist + unlock
//! ```

pub mod engine;
pub mod executor;
pub mod ops;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod timing;

pub use engine::Engine;
pub use executor::{StageExecutor, StageOutcome};
pub use ops::REASON_PAUSED;
pub use retry::{RetryDecision, RetryPolicy};
pub use timing::{FLOOR_SECS, resolve_next_due};
