//! # Cadence Core
//!
//! Shared foundation for the Cadence outbound sequence engine: the stage
//! enum, the per-lead sequence state record, collaborator traits (mail
//! transport, template/timing/lead stores), errors, and configuration.
//!
//! The engine crate builds on these seams; the store and mail crates
//! implement them. Nothing in here performs I/O except config loading.

pub mod config;
pub mod error;
pub mod stage;
pub mod state;
pub mod traits;
pub mod types;

pub use config::{CadenceConfig, SchedulerConfig};
pub use error::{CadenceError, Result};
pub use stage::Stage;
pub use state::{BatchResult, RepairResult, RunStatus, SendRecord, SendStatus, SequenceState};
pub use traits::{LeadDirectory, MailTransport, SequenceStore, TemplateStore, TimingStore};
pub use types::{
    DelayUnit, Lead, OutboundEmail, SendReceipt, SmtpAccount, Template, TimingConfig, TimingEntry,
};
