//! Persistent store for runs, phases, approval requests, save points,
//! baselines, learned rules and run hints.
//!
//! Backed by a single SQLite file under the project's artifact root.
//! Records are stored as JSON blobs alongside the columns the
//! orchestrator queries on: `(run_id, state)` for phases and
//! `(status, timeout_at)` for the approval sweeper. Every phase state
//! transition is a single statement; there is no multi-row state
//! machine spanning transactions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::approval::{ApprovalRequest, ApprovalStatus};
use crate::baseline::BaselineReport;
use crate::learning::{LearnedRule, RunHint, ANY_PHASE};
use crate::phase::{PhaseRecord, PhaseState, RunRecord, RunState};
use crate::workspace::SavePoint;

/// One entry of a phase's decision audit trail.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub run_id: String,
    pub phase_id: String,
    /// e.g. "governance-decision", "rollback", "doctor", "replan"
    pub kind: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path and run
    /// migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                record_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS phases (
                run_id TEXT NOT NULL,
                phase_id TEXT NOT NULL,
                state TEXT NOT NULL,
                record_json TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (run_id, phase_id)
            );

            CREATE TABLE IF NOT EXISTS approval_requests (
                request_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                phase_id TEXT NOT NULL,
                status TEXT NOT NULL,
                timeout_at TEXT NOT NULL,
                record_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS save_points (
                id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                phase_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS baselines (
                run_id TEXT PRIMARY KEY,
                report_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS learned_rules (
                rule_id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                record_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_hints (
                run_id TEXT NOT NULL,
                phase_id TEXT NOT NULL,
                body TEXT NOT NULL,
                successes INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, phase_id, body)
            );

            CREATE TABLE IF NOT EXISTS audit_trail (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                phase_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_phases_run_state ON phases(run_id, state);
            CREATE INDEX IF NOT EXISTS idx_approvals_status_timeout
                ON approval_requests(status, timeout_at);
            CREATE INDEX IF NOT EXISTS idx_audit_run_phase ON audit_trail(run_id, phase_id);
            ",
        )
        .context("Failed to run migrations")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn save_run(&self, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize run")?;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO runs (run_id, state, record_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id) DO UPDATE SET
                 state = excluded.state,
                 record_json = excluded.record_json,
                 updated_at = excluded.updated_at",
            params![
                record.run_id,
                record.state.as_str(),
                json,
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to save run")?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT record_json FROM runs WHERE run_id = ?1")
            .context("Failed to prepare get_run")?;
        let mut rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .context("Failed to query run")?;
        match rows.next() {
            Some(json) => {
                let json = json.context("Failed to read run row")?;
                Ok(Some(
                    serde_json::from_str(&json).context("Failed to deserialize run")?,
                ))
            }
            None => Ok(None),
        }
    }

    pub fn list_runs(&self) -> Result<Vec<(String, RunState)>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT run_id, state FROM runs ORDER BY updated_at DESC")
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    RunState::parse(&row.get::<_, String>(1)?),
                ))
            })
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?);
        }
        Ok(runs)
    }

    // ── Phases ────────────────────────────────────────────────────────

    pub fn save_phase(&self, record: &PhaseRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize phase")?;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO phases (run_id, phase_id, state, record_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(run_id, phase_id) DO UPDATE SET
                 state = excluded.state,
                 record_json = excluded.record_json,
                 updated_at = excluded.updated_at",
            params![
                record.run_id,
                record.spec.id,
                record.state.as_str(),
                json,
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to save phase")?;
        Ok(())
    }

    pub fn get_phase(&self, run_id: &str, phase_id: &str) -> Result<Option<PhaseRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT record_json FROM phases WHERE run_id = ?1 AND phase_id = ?2")
            .context("Failed to prepare get_phase")?;
        let mut rows = stmt
            .query_map(params![run_id, phase_id], |row| row.get::<_, String>(0))
            .context("Failed to query phase")?;
        match rows.next() {
            Some(json) => {
                let json = json.context("Failed to read phase row")?;
                Ok(Some(
                    serde_json::from_str(&json).context("Failed to deserialize phase")?,
                ))
            }
            None => Ok(None),
        }
    }

    /// Phases of a run in a given state; the `(run_id, state)` query
    /// the run orchestrator schedules from.
    pub fn phases_by_state(&self, run_id: &str, state: PhaseState) -> Result<Vec<PhaseRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT record_json FROM phases WHERE run_id = ?1 AND state = ?2")
            .context("Failed to prepare phases_by_state")?;
        let rows = stmt
            .query_map(params![run_id, state.as_str()], |row| {
                row.get::<_, String>(0)
            })
            .context("Failed to query phases")?;
        let mut phases = Vec::new();
        for row in rows {
            let json = row.context("Failed to read phase row")?;
            phases.push(serde_json::from_str(&json).context("Failed to deserialize phase")?);
        }
        Ok(phases)
    }

    pub fn list_phases(&self, run_id: &str) -> Result<Vec<PhaseRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT record_json FROM phases WHERE run_id = ?1 ORDER BY phase_id")
            .context("Failed to prepare list_phases")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .context("Failed to query phases")?;
        let mut phases = Vec::new();
        for row in rows {
            let json = row.context("Failed to read phase row")?;
            phases.push(serde_json::from_str(&json).context("Failed to deserialize phase")?);
        }
        Ok(phases)
    }

    // ── Approval requests ─────────────────────────────────────────────

    pub fn insert_approval(&self, request: &ApprovalRequest) -> Result<()> {
        let json = serde_json::to_string(request).context("Failed to serialize approval")?;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO approval_requests
                 (request_id, run_id, phase_id, status, timeout_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                request.request_id,
                request.run_id,
                request.phase_id,
                request.status.as_str(),
                request.timeout_at.to_rfc3339(),
                json
            ],
        )
        .context("Failed to insert approval request")?;
        Ok(())
    }

    pub fn get_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT record_json FROM approval_requests WHERE request_id = ?1")
            .context("Failed to prepare get_approval")?;
        let mut rows = stmt
            .query_map(params![request_id], |row| row.get::<_, String>(0))
            .context("Failed to query approval")?;
        match rows.next() {
            Some(json) => {
                let json = json.context("Failed to read approval row")?;
                Ok(Some(
                    serde_json::from_str(&json).context("Failed to deserialize approval")?,
                ))
            }
            None => Ok(None),
        }
    }

    /// Single-statement resolution: succeeds only if the request is
    /// still pending. This is what makes resolution first-wins
    /// idempotent across processes.
    pub fn resolve_approval(&self, resolved: &ApprovalRequest) -> Result<bool> {
        debug_assert_ne!(resolved.status, ApprovalStatus::Pending);
        let json = serde_json::to_string(resolved).context("Failed to serialize approval")?;
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn
            .execute(
                "UPDATE approval_requests
                 SET status = ?2, record_json = ?3
                 WHERE request_id = ?1 AND status = 'pending'",
                params![resolved.request_id, resolved.status.as_str(), json],
            )
            .context("Failed to resolve approval request")?;
        Ok(changed == 1)
    }

    /// Pending requests whose `timeout_at` has passed; the sweeper's
    /// `(status, timeout_at)` query.
    pub fn pending_past_timeout(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT record_json FROM approval_requests
                 WHERE status = 'pending' AND timeout_at <= ?1",
            )
            .context("Failed to prepare pending_past_timeout")?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], |row| row.get::<_, String>(0))
            .context("Failed to query approvals")?;
        let mut requests = Vec::new();
        for row in rows {
            let json = row.context("Failed to read approval row")?;
            requests.push(serde_json::from_str(&json).context("Failed to deserialize approval")?);
        }
        Ok(requests)
    }

    /// Pending requests belonging to one phase, for cancellation.
    pub fn pending_for_phase(&self, run_id: &str, phase_id: &str) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT record_json FROM approval_requests
                 WHERE status = 'pending' AND run_id = ?1 AND phase_id = ?2",
            )
            .context("Failed to prepare pending_for_phase")?;
        let rows = stmt
            .query_map(params![run_id, phase_id], |row| row.get::<_, String>(0))
            .context("Failed to query approvals")?;
        let mut requests = Vec::new();
        for row in rows {
            let json = row.context("Failed to read approval row")?;
            requests.push(serde_json::from_str(&json).context("Failed to deserialize approval")?);
        }
        Ok(requests)
    }

    pub fn pending_for_run(&self, run_id: &str) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT record_json FROM approval_requests
                 WHERE status = 'pending' AND run_id = ?1",
            )
            .context("Failed to prepare pending_for_run")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .context("Failed to query approvals")?;
        let mut requests = Vec::new();
        for row in rows {
            let json = row.context("Failed to read approval row")?;
            requests.push(serde_json::from_str(&json).context("Failed to deserialize approval")?);
        }
        Ok(requests)
    }

    // ── Save points ───────────────────────────────────────────────────

    pub fn record_save_point(&self, run_id: &str, save_point: &SavePoint) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO save_points (id, run_id, phase_id, attempt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                save_point.id,
                run_id,
                save_point.phase_id,
                save_point.attempt,
                save_point.created_at.to_rfc3339()
            ],
        )
        .context("Failed to record save point")?;
        Ok(())
    }

    pub fn save_points_for_phase(&self, run_id: &str, phase_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id FROM save_points
                 WHERE run_id = ?1 AND phase_id = ?2 ORDER BY attempt",
            )
            .context("Failed to prepare save_points_for_phase")?;
        let rows = stmt
            .query_map(params![run_id, phase_id], |row| row.get::<_, String>(0))
            .context("Failed to query save points")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read save point row")?);
        }
        Ok(ids)
    }

    // ── Baselines ─────────────────────────────────────────────────────

    pub fn save_baseline(&self, run_id: &str, report: &BaselineReport) -> Result<()> {
        let json = serde_json::to_string(report).context("Failed to serialize baseline")?;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO baselines (run_id, report_json) VALUES (?1, ?2)
             ON CONFLICT(run_id) DO UPDATE SET report_json = excluded.report_json",
            params![run_id, json],
        )
        .context("Failed to save baseline")?;
        Ok(())
    }

    pub fn get_baseline(&self, run_id: &str) -> Result<Option<BaselineReport>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT report_json FROM baselines WHERE run_id = ?1")
            .context("Failed to prepare get_baseline")?;
        let mut rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .context("Failed to query baseline")?;
        match rows.next() {
            Some(json) => {
                let json = json.context("Failed to read baseline row")?;
                Ok(Some(
                    serde_json::from_str(&json).context("Failed to deserialize baseline")?,
                ))
            }
            None => Ok(None),
        }
    }

    // ── Learned rules ─────────────────────────────────────────────────

    pub fn upsert_learned_rule(&self, rule: &LearnedRule) -> Result<()> {
        let json = serde_json::to_string(rule).context("Failed to serialize rule")?;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO learned_rules (rule_id, scope, record_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(rule_id) DO UPDATE SET
                 scope = excluded.scope,
                 record_json = excluded.record_json",
            params![rule.rule_id, rule.scope, json],
        )
        .context("Failed to upsert learned rule")?;
        Ok(())
    }

    pub fn list_learned_rules(&self) -> Result<Vec<LearnedRule>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT record_json FROM learned_rules ORDER BY rule_id")
            .context("Failed to prepare list_learned_rules")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query rules")?;
        let mut rules = Vec::new();
        for row in rows {
            let json = row.context("Failed to read rule row")?;
            rules.push(serde_json::from_str(&json).context("Failed to deserialize rule")?);
        }
        Ok(rules)
    }

    // ── Run hints ─────────────────────────────────────────────────────

    pub fn add_run_hint(&self, run_id: &str, phase_id: &str, body: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO run_hints (run_id, phase_id, body, successes, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![run_id, phase_id, body, Utc::now().to_rfc3339()],
        )
        .context("Failed to add run hint")?;
        Ok(())
    }

    pub fn increment_hint_successes(&self, run_id: &str, phase_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE run_hints SET successes = successes + 1
             WHERE run_id = ?1 AND (phase_id = ?2 OR phase_id = ?3)",
            params![run_id, phase_id, ANY_PHASE],
        )
        .context("Failed to increment hint successes")?;
        Ok(())
    }

    /// Hints for the given phase plus wildcard hints of the run.
    pub fn hints_for_phase(&self, run_id: &str, phase_id: &str) -> Result<Vec<RunHint>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT run_id, phase_id, body, successes, created_at FROM run_hints
                 WHERE run_id = ?1 AND (phase_id = ?2 OR phase_id = ?3)
                 ORDER BY created_at",
            )
            .context("Failed to prepare hints_for_phase")?;
        let rows = stmt
            .query_map(params![run_id, phase_id, ANY_PHASE], Self::hint_from_row)
            .context("Failed to query hints")?;
        let mut hints = Vec::new();
        for row in rows {
            hints.push(row.context("Failed to read hint row")?);
        }
        Ok(hints)
    }

    pub fn all_run_hints(&self, run_id: &str) -> Result<Vec<RunHint>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT run_id, phase_id, body, successes, created_at FROM run_hints
                 WHERE run_id = ?1 ORDER BY created_at",
            )
            .context("Failed to prepare all_run_hints")?;
        let rows = stmt
            .query_map(params![run_id], Self::hint_from_row)
            .context("Failed to query hints")?;
        let mut hints = Vec::new();
        for row in rows {
            hints.push(row.context("Failed to read hint row")?);
        }
        Ok(hints)
    }

    pub fn delete_run_hints(&self, run_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM run_hints WHERE run_id = ?1", params![run_id])
            .context("Failed to delete run hints")?;
        Ok(())
    }

    fn hint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunHint> {
        let created_at: String = row.get(4)?;
        Ok(RunHint {
            run_id: row.get(0)?,
            phase_id: row.get(1)?,
            body: row.get(2)?,
            successes: row.get(3)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    // ── Audit trail ───────────────────────────────────────────────────

    pub fn append_audit(
        &self,
        run_id: &str,
        phase_id: &str,
        kind: &str,
        detail: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO audit_trail (run_id, phase_id, kind, detail, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, phase_id, kind, detail, Utc::now().to_rfc3339()],
        )
        .context("Failed to append audit entry")?;
        Ok(())
    }

    pub fn audit_trail(&self, run_id: &str, phase_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT seq, run_id, phase_id, kind, detail, timestamp FROM audit_trail
                 WHERE run_id = ?1 AND phase_id = ?2 ORDER BY seq",
            )
            .context("Failed to prepare audit_trail")?;
        let rows = stmt
            .query_map(params![run_id, phase_id], |row| {
                let timestamp: String = row.get(5)?;
                Ok(AuditEntry {
                    seq: row.get(0)?,
                    run_id: row.get(1)?,
                    phase_id: row.get(2)?,
                    kind: row.get(3)?,
                    detail: row.get(4)?,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .context("Failed to query audit trail")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("Failed to read audit row")?);
        }
        Ok(entries)
    }
}
