//! # Cadence Mail
//!
//! Outbound SMTP delivery (async lettre) and `{{variable}}` template
//! rendering. Implements the `MailTransport` seam consumed by the engine.

pub mod render;
pub mod smtp;

pub use render::render_email;
pub use smtp::Smtp;
