//! # Cadence — outbound sequence engine
//!
//! Seven-touch email campaign automation: each lead walks touch1..touch7
//! on the owning account's timing, with at-most-once delivery per stage.
//!
//! Usage:
//!   cadence once                         # one scheduler sweep (cron-friendly)
//!   cadence run --every 60              # built-in periodic trigger
//!   cadence start --lead l1 --stage 1   # put a lead under automation
//!   cadence reconcile                   # repair drifted leads

use std::sync::Arc;

use anyhow::Result;
use cadence_core::{CadenceConfig, Stage};
use cadence_engine::Engine;
use cadence_mail::Smtp;
use cadence_store::SequenceDb;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", version, about = "📮 Cadence — outbound sequence engine")]
struct Cli {
    /// Config file (default ~/.cadence/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Database path (overrides config)
    #[arg(long)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scheduler sweep and exit (for external cron triggers)
    Once,
    /// Run the scheduler on an interval, forever
    Run {
        /// Seconds between sweeps
        #[arg(long, default_value = "60")]
        every: u64,
    },
    /// Start automation for a lead
    Start {
        #[arg(long)]
        lead: String,
        /// Starting stage ("touch1".."touch7" or "1".."7")
        #[arg(long, default_value = "touch1")]
        stage: String,
    },
    /// Stop automation for a lead
    Stop {
        #[arg(long)]
        lead: String,
        #[arg(long, default_value = "manual stop")]
        reason: String,
    },
    /// Pause automation (resumable)
    Pause {
        #[arg(long)]
        lead: String,
    },
    /// Resume a paused/stopped sequence
    Resume {
        #[arg(long)]
        lead: String,
    },
    /// Repair drifted sequence state from send history
    Reconcile {
        /// Single lead; omit to sweep all active leads
        #[arg(long)]
        lead: Option<String>,
    },
    /// Show one lead's sequence state
    Status {
        #[arg(long)]
        lead: String,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "cadence=debug,cadence_engine=debug,cadence_store=debug"
    } else {
        "cadence=info,cadence_engine=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => CadenceConfig::load_from(std::path::Path::new(&expand_path(path)))?,
        None => CadenceConfig::load()?,
    };

    let db_path = expand_path(cli.db.as_deref().unwrap_or(&config.db_path));
    let db = Arc::new(SequenceDb::open(std::path::Path::new(&db_path))?);
    let engine = Engine::new(
        db.clone(),
        db.clone(),
        db.clone(),
        db.clone(),
        Arc::new(Smtp::new()),
        config,
    );

    match cli.command {
        Command::Once => {
            let batch = engine.run_once().await?;
            println!(
                "processed {} | sent {} | failed {} | completed {} | skipped {}",
                batch.processed, batch.sent, batch.failed, batch.completed, batch.skipped
            );
            for failure in &batch.failures {
                println!("  ✗ {}: {}", failure.lead_id, failure.reason);
            }
        }
        Command::Run { every } => {
            engine.run_loop(every).await;
        }
        Command::Start { lead, stage } => {
            let stage: Stage = stage.parse()?;
            let state = engine.start_sequence(&lead, stage)?;
            println!(
                "▶️ {} started at {} (due {})",
                lead,
                state.stage,
                state.next_due_at.map(|d| d.to_rfc3339()).unwrap_or_default()
            );
        }
        Command::Stop { lead, reason } => {
            engine.stop_sequence(&lead, &reason)?;
            println!("⏹️ {lead} stopped");
        }
        Command::Pause { lead } => {
            engine.pause_sequence(&lead)?;
            println!("⏸️ {lead} paused");
        }
        Command::Resume { lead } => {
            let state = engine.resume_sequence(&lead)?;
            println!(
                "⏯️ {} resumed at {} (due {})",
                lead,
                state.stage,
                state.next_due_at.map(|d| d.to_rfc3339()).unwrap_or_default()
            );
        }
        Command::Reconcile { lead } => match lead {
            Some(lead) => {
                let result = engine.reconcile_lead(&lead)?;
                println!("{lead}: {result:?}");
            }
            None => {
                let results = engine.reconcile_all()?;
                if results.is_empty() {
                    println!("no active leads");
                }
                for (lead, result) in results {
                    println!("{lead}: {result:?}");
                }
            }
        },
        Command::Status { lead } => {
            let state = cadence_core::SequenceStore::get(db.as_ref(), &lead)?;
            println!("lead:     {}", state.lead_id);
            println!("active:   {} (enabled: {})", state.active, state.enabled);
            println!(
                "position: {} (step {}{})",
                state.stage,
                state.step,
                if state.is_complete() { ", complete" } else { "" }
            );
            println!(
                "due:      {}",
                state
                    .next_due_at
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_else(|| "-".into())
            );
            println!(
                "retries:  {}/{}",
                state.retry_count, state.max_retries
            );
            if let Some(reason) = &state.stopped_reason {
                println!("stopped:  {reason}");
            }
            println!("history:  {} attempt(s)", state.history.len());
            for record in state.history.iter().rev().take(10) {
                println!(
                    "  {} {} {:?}{}",
                    record.attempted_at.to_rfc3339(),
                    record.stage,
                    record.status,
                    record
                        .error
                        .as_deref()
                        .map(|e| format!(" — {e}"))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
