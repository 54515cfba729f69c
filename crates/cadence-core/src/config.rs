//! Cadence configuration system.
//!
//! Everything is threaded explicitly through calls — there is no
//! process-wide cached settings singleton.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{CadenceError, Result};
use crate::types::SmtpAccount;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// SMTP credentials keyed by account id.
    #[serde(default)]
    pub accounts: HashMap<String, SmtpAccount>,
}

fn default_db_path() -> String {
    "~/.cadence/cadence.db".into()
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scheduler: SchedulerConfig::default(),
            accounts: HashMap::new(),
        }
    }
}

/// Scheduler and executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Courtesy delay between sends in a batch (outbound rate limits).
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Claims older than this are treated as abandoned and reclaimable.
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    /// Executor skips a stage already sent within this window.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// Upper bound on one SMTP send.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Failed sends per stage before the lead goes terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed backoff after a failed send.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_batch_delay_ms() -> u64 {
    1000
}
fn default_stale_claim_secs() -> u64 {
    600
}
fn default_debounce_secs() -> u64 {
    7200
}
fn default_send_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_backoff_secs() -> u64 {
    600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: default_batch_delay_ms(),
            stale_claim_secs: default_stale_claim_secs(),
            debounce_secs: default_debounce_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
            .join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }

    /// Credentials for an account; `NotFound` when unconfigured.
    pub fn account(&self, account_id: &str) -> Result<&SmtpAccount> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| CadenceError::NotFound(format!("no SMTP account '{account_id}'")))
    }
}
