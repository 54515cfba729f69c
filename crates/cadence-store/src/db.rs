//! SQLite-backed store for sequence states, send history, templates,
//! timing, and leads.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings (millisecond
//! precision, `Z` suffix) so lexicographic SQL comparison matches
//! chronological order.

use std::path::Path;
use std::sync::Mutex;

use cadence_core::error::{CadenceError, Result};
use cadence_core::stage::Stage;
use cadence_core::state::{RunStatus, SendRecord, SendStatus, SequenceState};
use cadence_core::traits::{LeadDirectory, SequenceStore, TemplateStore, TimingStore};
use cadence_core::types::{DelayUnit, Lead, Template, TimingConfig, TimingEntry};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::Connection;

/// One SQLite file backing a whole deployment.
pub struct SequenceDb {
    conn: Mutex<Connection>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CadenceError::Store(format!("corrupt timestamp '{s}': {e}")))
}

fn parse_stage(s: &str) -> Result<Stage> {
    Stage::parse(s).ok_or_else(|| CadenceError::Store(format!("corrupt stage '{s}'")))
}

fn parse_status(s: &str) -> Result<SendStatus> {
    match s {
        "sent" => Ok(SendStatus::Sent),
        "failed" => Ok(SendStatus::Failed),
        other => Err(CadenceError::Store(format!("corrupt send status '{other}'"))),
    }
}

fn store_err(e: impl std::fmt::Display) -> CadenceError {
    CadenceError::Store(e.to_string())
}

impl SequenceDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        // One writer at a time per file; readers don't block it.
        conn.pragma_update(None, "journal_mode", "wal").ok();
        conn.pragma_update(None, "busy_timeout", 5000).ok();
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            -- One row per lead under automation.
            CREATE TABLE IF NOT EXISTS sequence_states (
                lead_id TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 1,
                active INTEGER NOT NULL DEFAULT 1,
                stage TEXT NOT NULL,
                step INTEGER NOT NULL,
                next_due_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                stopped_reason TEXT,
                run_status TEXT NOT NULL DEFAULT 'idle',
                claimed_at TEXT,
                claim_token TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Append-only send history, one row per attempted send.
            CREATE TABLE IF NOT EXISTS send_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                attempted_at TEXT NOT NULL,
                status TEXT NOT NULL,
                message_id TEXT,
                error TEXT,
                retry_of_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_send_records_lead ON send_records(lead_id);

            -- Stage templates, per account.
            CREATE TABLE IF NOT EXISTS templates (
                account_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                subject TEXT NOT NULL,
                html_body TEXT NOT NULL,
                text_body TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, stage)
            );

            -- Per-account stage delays; absent rows fall back to defaults.
            CREATE TABLE IF NOT EXISTS timing_entries (
                account_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                delay_amount INTEGER NOT NULL,
                delay_unit TEXT NOT NULL,
                PRIMARY KEY (account_id, stage)
            );

            -- Minimal lead directory; CRUD lives outside the engine.
            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                email TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                company TEXT
            );
            ",
        )
        .map_err(|e| CadenceError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Leads / templates / timing (seed + lookup) ───────────────

    /// Insert or update a lead.
    pub fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO leads (id, account_id, email, first_name, last_name, company)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                lead.id,
                lead.account_id,
                lead.email,
                lead.first_name,
                lead.last_name,
                lead.company,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Publish (or replace) the template for a stage.
    pub fn upsert_template(
        &self,
        account_id: &str,
        stage: Stage,
        template: &Template,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO templates
             (account_id, stage, subject, html_body, text_body, active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            rusqlite::params![
                account_id,
                stage.as_str(),
                template.subject,
                template.html_body,
                template.text_body,
                ts(Utc::now()),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Deactivate the template for a stage without deleting it.
    pub fn deactivate_template(&self, account_id: &str, stage: Stage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE templates SET active = 0 WHERE account_id = ?1 AND stage = ?2",
            rusqlite::params![account_id, stage.as_str()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Set the delay for one stage of an account.
    pub fn set_timing(&self, account_id: &str, entry: &TimingEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO timing_entries (account_id, stage, delay_amount, delay_unit)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                account_id,
                entry.stage.as_str(),
                entry.delay_amount,
                entry.delay_unit.as_str(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn load_history(&self, conn: &Connection, lead_id: &str) -> Result<Vec<SendRecord>> {
        let mut stmt = conn
            .prepare(
                "SELECT stage, attempted_at, status, message_id, error, retry_of_count
                 FROM send_records WHERE lead_id = ?1 ORDER BY id",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([lead_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, u32>(5)?,
                ))
            })
            .map_err(store_err)?;
        let mut history = Vec::new();
        for row in rows {
            let (stage, attempted_at, status, message_id, error, retry_of_count) =
                row.map_err(store_err)?;
            history.push(SendRecord {
                stage: parse_stage(&stage)?,
                attempted_at: parse_ts(&attempted_at)?,
                status: parse_status(&status)?,
                message_id,
                error,
                retry_of_count,
            });
        }
        Ok(history)
    }

    fn read_state(&self, conn: &Connection, lead_id: &str) -> Result<SequenceState> {
        // Raw columns come out of the closure; parsing happens after so a
        // corrupt row surfaces as a `Store` error, not a silent default.
        let row = conn
            .query_row(
                "SELECT lead_id, enabled, active, stage, step, next_due_at, retry_count,
                        max_retries, stopped_reason, run_status, claimed_at, claim_token,
                        created_at, updated_at
                 FROM sequence_states WHERE lead_id = ?1",
                [lead_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i32>(1)?,
                        row.get::<_, i32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, u32>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, String>(12)?,
                        row.get::<_, String>(13)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    CadenceError::NotFound(format!("no sequence for lead '{lead_id}'"))
                }
                other => store_err(other),
            })?;
        let (
            id,
            enabled,
            active,
            stage,
            step,
            next_due_at,
            retry_count,
            max_retries,
            stopped_reason,
            run_status,
            claimed_at,
            claim_token,
            created_at,
            updated_at,
        ) = row;
        let run_status = match run_status.as_str() {
            "idle" => RunStatus::Idle,
            "claimed" => RunStatus::Claimed,
            other => {
                return Err(CadenceError::Store(format!("corrupt run status '{other}'")));
            }
        };
        Ok(SequenceState {
            lead_id: id,
            enabled: enabled != 0,
            active: active != 0,
            stage: parse_stage(&stage)?,
            step,
            next_due_at: next_due_at.as_deref().map(parse_ts).transpose()?,
            history: self.load_history(conn, lead_id)?,
            retry_count,
            max_retries,
            stopped_reason,
            run_status,
            claimed_at: claimed_at.as_deref().map(parse_ts).transpose()?,
            claim_token,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    /// Append any history rows not yet on disk. History is append-only, so
    /// the tail past the stored count is exactly what this claim produced.
    fn append_history(&self, conn: &Connection, state: &SequenceState) -> Result<()> {
        let stored: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM send_records WHERE lead_id = ?1",
                [&state.lead_id],
                |r| r.get(0),
            )
            .map_err(store_err)?;
        for record in state.history.iter().skip(stored as usize) {
            conn.execute(
                "INSERT INTO send_records
                 (lead_id, stage, attempted_at, status, message_id, error, retry_of_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    state.lead_id,
                    record.stage.as_str(),
                    ts(record.attempted_at),
                    match record.status {
                        SendStatus::Sent => "sent",
                        SendStatus::Failed => "failed",
                    },
                    record.message_id,
                    record.error,
                    record.retry_of_count,
                ],
            )
            .map_err(store_err)?;
        }
        Ok(())
    }
}

impl SequenceStore for SequenceDb {
    fn insert(&self, state: &SequenceState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO sequence_states
                 (lead_id, enabled, active, stage, step, next_due_at, retry_count,
                  max_retries, stopped_reason, run_status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'idle', ?10, ?11)",
                rusqlite::params![
                    state.lead_id,
                    state.enabled as i32,
                    state.active as i32,
                    state.stage.as_str(),
                    state.step,
                    state.next_due_at.map(ts),
                    state.retry_count,
                    state.max_retries,
                    state.stopped_reason,
                    ts(state.created_at),
                    ts(state.updated_at),
                ],
            )
            .map_err(store_err)?;
        if inserted == 0 {
            return Err(CadenceError::Validation(format!(
                "sequence already exists for lead '{}'",
                state.lead_id
            )));
        }
        Ok(())
    }

    fn get(&self, lead_id: &str) -> Result<SequenceState> {
        let conn = self.conn.lock().unwrap();
        self.read_state(&conn, lead_id)
    }

    fn due(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let stale_before = ts(now - stale_after);
        let mut stmt = conn
            .prepare(
                "SELECT lead_id FROM sequence_states
                 WHERE active = 1 AND next_due_at IS NOT NULL AND next_due_at <= ?1
                   AND (run_status = 'idle'
                        OR (run_status = 'claimed' AND claimed_at <= ?2))
                 ORDER BY next_due_at",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(rusqlite::params![ts(now), stale_before], |row| row.get(0))
            .map_err(store_err)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn claim(
        &self,
        lead_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
        due_only: bool,
    ) -> Result<SequenceState> {
        let conn = self.conn.lock().unwrap();
        let token = uuid::Uuid::new_v4().to_string();
        let stale_before = ts(now - stale_after);
        // Compare-and-set: the same predicate that found the candidate
        // guards the transition to claimed. Exactly one caller wins.
        // Scheduler claims (`due_only`) also require the record to still
        // be active and due; lifecycle operations claim any record.
        let due_clause = if due_only {
            "AND active = 1 AND next_due_at IS NOT NULL AND next_due_at <= ?3"
        } else {
            "AND ?3 = ?3"
        };
        let sql = format!(
            "UPDATE sequence_states
             SET run_status = 'claimed', claimed_at = ?3, claim_token = ?4
             WHERE lead_id = ?1 {due_clause}
               AND (run_status = 'idle'
                    OR (run_status = 'claimed' AND claimed_at <= ?2))"
        );
        let changed = conn
            .execute(
                &sql,
                rusqlite::params![lead_id, stale_before, ts(now), token],
            )
            .map_err(store_err)?;
        if changed == 0 {
            // Distinguish "doesn't exist" from "someone else holds it".
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM sequence_states WHERE lead_id = ?1",
                    [lead_id],
                    |r| r.get::<_, i64>(0),
                )
                .map(|n| n > 0)
                .map_err(store_err)?;
            return if exists {
                Err(CadenceError::ClaimConflict)
            } else {
                Err(CadenceError::NotFound(format!(
                    "no sequence for lead '{lead_id}'"
                )))
            };
        }
        self.read_state(&conn, lead_id)
    }

    fn release(&self, state: &SequenceState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // The update is guarded by the claim token taken at claim time. A
        // holder whose lease went stale may have been reclaimed; its
        // snapshot is out of date and must not overwrite the reclaiming
        // run's progress.
        let Some(token) = state.claim_token.as_deref() else {
            return Err(CadenceError::ClaimConflict);
        };
        let changed = conn
            .execute(
                "UPDATE sequence_states SET
                    enabled = ?2, active = ?3, stage = ?4, step = ?5, next_due_at = ?6,
                    retry_count = ?7, max_retries = ?8, stopped_reason = ?9,
                    run_status = 'idle', claimed_at = NULL, claim_token = NULL,
                    updated_at = ?10
                 WHERE lead_id = ?1 AND claim_token = ?11",
                rusqlite::params![
                    state.lead_id,
                    state.enabled as i32,
                    state.active as i32,
                    state.stage.as_str(),
                    state.step,
                    state.next_due_at.map(ts),
                    state.retry_count,
                    state.max_retries,
                    state.stopped_reason,
                    ts(state.updated_at),
                    token,
                ],
            )
            .map_err(store_err)?;
        if changed == 0 {
            tracing::warn!(
                "⚠️ [{}] lease lost before release, dropping snapshot",
                state.lead_id
            );
            return Err(CadenceError::ClaimConflict);
        }
        self.append_history(&conn, state)
    }

    fn active_leads(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT lead_id FROM sequence_states WHERE active = 1 ORDER BY lead_id")
            .map_err(store_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(store_err)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

impl TemplateStore for SequenceDb {
    fn active_template(&self, account_id: &str, stage: Stage) -> Result<Option<Template>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT subject, html_body, text_body FROM templates
                 WHERE account_id = ?1 AND stage = ?2 AND active = 1",
                rusqlite::params![account_id, stage.as_str()],
                |row| {
                    Ok(Template {
                        subject: row.get(0)?,
                        html_body: row.get(1)?,
                        text_body: row.get(2)?,
                    })
                },
            );
        match row {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }
}

impl TimingStore for SequenceDb {
    fn timing_config(&self, account_id: &str) -> Result<TimingConfig> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT stage, delay_amount, delay_unit FROM timing_entries
                 WHERE account_id = ?1",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([account_id], |row| {
                let stage_str: String = row.get(0)?;
                let unit_str: String = row.get(2)?;
                Ok((stage_str, row.get::<_, i64>(1)?, unit_str))
            })
            .map_err(store_err)?;
        let mut entries = Vec::new();
        for row in rows {
            let (stage, delay_amount, unit) = row.map_err(store_err)?;
            entries.push(TimingEntry {
                stage: parse_stage(&stage)?,
                delay_amount,
                // Unknown units deliberately fall back to minutes.
                delay_unit: DelayUnit::parse(&unit),
            });
        }
        Ok(TimingConfig { entries })
    }
}

impl LeadDirectory for SequenceDb {
    fn lead(&self, lead_id: &str) -> Result<Lead> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, account_id, email, first_name, last_name, company
             FROM leads WHERE id = ?1",
            [lead_id],
            |row| {
                Ok(Lead {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    email: row.get(2)?,
                    first_name: row.get(3)?,
                    last_name: row.get(4)?,
                    company: row.get(5)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                CadenceError::NotFound(format!("no lead '{lead_id}'"))
            }
            other => store_err(other),
        })
    }
}
