//! Domain records shared across the workspace: leads, templates, timing
//! configuration, and the mail-transport payloads.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};

/// A sales lead under (or eligible for) automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    /// Opaque lead key.
    pub id: String,
    /// Owning account — selects credentials, templates, and timing.
    pub account_id: String,
    /// Destination address.
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

/// An email template for one stage. Subject and bodies may carry
/// `{{first_name}}`-style placeholders filled from the lead record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: String,
}

/// Delay unit for a timing entry. Unknown units fall back to minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    /// Parse a unit name, defaulting to minutes for anything unrecognized.
    pub fn parse(s: &str) -> DelayUnit {
        match s.trim().to_ascii_lowercase().as_str() {
            "hours" | "hour" => DelayUnit::Hours,
            "days" | "day" => DelayUnit::Days,
            _ => DelayUnit::Minutes,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DelayUnit::Minutes => "minutes",
            DelayUnit::Hours => "hours",
            DelayUnit::Days => "days",
        }
    }

    /// Convert an amount of this unit into a chrono duration.
    pub fn to_duration(&self, amount: i64) -> chrono::Duration {
        match self {
            DelayUnit::Minutes => chrono::Duration::minutes(amount),
            DelayUnit::Hours => chrono::Duration::hours(amount),
            DelayUnit::Days => chrono::Duration::days(amount),
        }
    }
}

/// One row of per-account timing: how long to wait before `stage` fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingEntry {
    pub stage: Stage,
    pub delay_amount: i64,
    pub delay_unit: DelayUnit,
}

/// Per-account timing configuration. May be partial or empty; absent
/// stages fall back to the built-in default table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default)]
    pub entries: Vec<TimingEntry>,
}

impl TimingConfig {
    /// Look up the entry for a stage, if configured.
    pub fn for_stage(&self, stage: Stage) -> Option<&TimingEntry> {
        self.entries.iter().find(|e| e.stage == stage)
    }
}

/// Per-account SMTP credentials and relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpAccount {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for SmtpAccount {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".into(),
            smtp_port: 587,
            email: String::new(),
            password: String::new(),
            display_name: None,
        }
    }
}

/// A fully rendered outbound email, ready for the transport.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Receipt from a successful send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
}
