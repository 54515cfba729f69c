//! # Cadence Store
//!
//! SQLite-backed persistence for the sequence engine. One database file
//! holds sequence states (with the atomic claim column), the append-only
//! send history, per-account templates and timing rows, and a minimal lead
//! directory.
//!
//! The claim is a single conditional `UPDATE` filtered on the current
//! run status — compare-and-set semantics, so concurrent scheduler runs
//! can never both hold the same lead.

pub mod db;

pub use db::SequenceDb;
