//! Plan and phase data model for the Autopack orchestrator.
//!
//! This module provides:
//! - `PhaseSpec` — the client-submitted description of a unit of work
//! - `BuildPlan` — an ordered set of phases plus plan metadata, with
//!   JSON loading and validation (cycles, unknown dependencies,
//!   scope/protected overlap)
//! - `PhaseRecord` / `RunRecord` — the durable runtime state driven by
//!   the orchestrator

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::errors::FailureCategory;

/// Phase complexity, drives the default model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

/// A client-submitted phase description: the *what* of a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    /// Stable identifier within the plan (e.g., "01", "db-schema")
    pub id: String,
    /// Free-text description of what the phase must achieve
    pub goal: String,
    /// Workspace-relative paths the phase must create or modify
    pub deliverables: Vec<String>,
    /// Natural-language conditions consumed by Builder/Auditor prompts
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Workspace-relative paths or directory prefixes the phase may modify
    pub scope_paths: Vec<String>,
    /// Protected paths specific to this phase, unioned with the global set
    #[serde(default)]
    pub protected_paths: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    /// Phase ids that must be complete before this phase may run
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PhaseSpec {
    /// Check the per-phase invariant: a path cannot be both in scope
    /// and protected at phase start.
    pub fn validate(&self) -> Result<()> {
        if self.goal.trim().is_empty() {
            bail!("Phase {}: goal must not be empty", self.id);
        }
        if self.deliverables.is_empty() {
            bail!("Phase {}: deliverables must not be empty", self.id);
        }
        if self.scope_paths.is_empty() {
            bail!("Phase {}: scope_paths must not be empty", self.id);
        }
        let protected: HashSet<&String> = self.protected_paths.iter().collect();
        for scope in &self.scope_paths {
            if protected.contains(scope) {
                bail!(
                    "Phase {}: path {} is both in scope and protected",
                    self.id,
                    scope
                );
            }
        }
        Ok(())
    }
}

/// The full client-submitted plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Human-readable plan name
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<PhaseSpec>,
}

impl BuildPlan {
    /// Load a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        let plan: BuildPlan = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))?;
        Ok(plan)
    }

    /// Save the plan to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize plan to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
        Ok(())
    }

    /// SHA-256 of the canonical JSON form, recorded on the run.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{:x}", digest)
    }

    pub fn get_phase(&self, id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Validate the whole plan: per-phase invariants, duplicate ids,
    /// unknown dependencies and dependency cycles.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            bail!("Plan has no phases");
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.id.as_str()) {
                bail!("Duplicate phase id: {}", phase.id);
            }
            phase.validate()?;
        }

        for phase in &self.phases {
            for dep in &phase.dependencies {
                if !seen.contains(dep.as_str()) {
                    bail!("Phase {} depends on unknown phase {}", phase.id, dep);
                }
                if dep == &phase.id {
                    bail!("Phase {} depends on itself", phase.id);
                }
            }
        }

        self.check_cycles()?;
        Ok(())
    }

    /// Depth-first cycle detection over the dependency graph.
    fn check_cycles(&self) -> Result<()> {
        let deps: HashMap<&str, &Vec<String>> = self
            .phases
            .iter()
            .map(|p| (p.id.as_str(), &p.dependencies))
            .collect();

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<&str, u8> = HashMap::new();

        fn visit<'a>(
            node: &'a str,
            deps: &HashMap<&'a str, &'a Vec<String>>,
            state: &mut HashMap<&'a str, u8>,
        ) -> Result<()> {
            match state.get(node) {
                Some(1) => bail!("Dependency cycle involving phase {}", node),
                Some(2) => return Ok(()),
                _ => {}
            }
            state.insert(node, 1);
            if let Some(node_deps) = deps.get(node) {
                for dep in node_deps.iter() {
                    visit(dep, deps, state)?;
                }
            }
            state.insert(node, 2);
            Ok(())
        }

        for phase in &self.phases {
            visit(phase.id.as_str(), &deps, &mut state)?;
        }
        Ok(())
    }

    /// Phase ids in a valid execution order (dependencies first).
    /// Assumes `validate` has passed.
    pub fn topological_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut remaining: Vec<&PhaseSpec> = self.phases.iter().collect();

        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|p| {
                if p.dependencies.iter().all(|d| done.contains(d)) {
                    order.push(p.id.clone());
                    done.insert(p.id.clone());
                    false
                } else {
                    true
                }
            });
            if remaining.len() == before {
                // Cycle; validate() rejects this, stop rather than spin.
                break;
            }
        }
        order
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Queued,
    Running,
    Paused,
    Complete,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed | RunState::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Complete => "complete",
            RunState::Failed => "failed",
            RunState::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => RunState::Queued,
            "running" => RunState::Running,
            "paused" => RunState::Paused,
            "complete" => RunState::Complete,
            "failed" => RunState::Failed,
            "aborted" => RunState::Aborted,
            _ => RunState::Queued,
        }
    }
}

/// Lifecycle state of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseState {
    #[default]
    Queued,
    Running,
    Complete,
    Blocked,
    Failed,
    AwaitingApproval,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Queued => "queued",
            PhaseState::Running => "running",
            PhaseState::Complete => "complete",
            PhaseState::Blocked => "blocked",
            PhaseState::Failed => "failed",
            PhaseState::AwaitingApproval => "awaiting-approval",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => PhaseState::Queued,
            "running" => PhaseState::Running,
            "complete" => PhaseState::Complete,
            "blocked" => PhaseState::Blocked,
            "failed" => PhaseState::Failed,
            "awaiting-approval" => PhaseState::AwaitingApproval,
            _ => PhaseState::Queued,
        }
    }
}

/// One normalized failure, appended to a phase's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: FailureCategory,
    /// Message with paths, line numbers, timestamps and pids masked
    pub normalized_message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(category: FailureCategory, normalized_message: impl Into<String>) -> Self {
        Self {
            category,
            normalized_message: normalized_message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Durable runtime state of a phase within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub run_id: String,
    pub spec: PhaseSpec,
    /// Immutable snapshot of the goal taken on first attempt; the
    /// anchor every re-plan is checked against
    pub original_intent: String,
    pub state: PhaseState,
    pub retry_attempt: u32,
    pub escalation_level: u32,
    pub replans: u32,
    pub doctor_invocations: u32,
    pub error_history: Vec<ErrorRecord>,
    /// Ephemeral per-phase hints accumulated during this run
    pub learning_hints: Vec<String>,
    pub last_failure: Option<ErrorRecord>,
    pub updated_at: DateTime<Utc>,
}

impl PhaseRecord {
    pub fn new(run_id: &str, spec: PhaseSpec) -> Self {
        let original_intent = spec.goal.clone();
        Self {
            run_id: run_id.to_string(),
            spec,
            original_intent,
            state: PhaseState::Queued,
            retry_attempt: 0,
            escalation_level: 0,
            replans: 0,
            doctor_invocations: 0,
            error_history: Vec::new(),
            learning_hints: Vec::new(),
            last_failure: None,
            updated_at: Utc::now(),
        }
    }

    /// Record a failure in the history and as the latest failure.
    pub fn record_failure(&mut self, record: ErrorRecord) {
        self.last_failure = Some(record.clone());
        self.error_history.push(record);
        self.updated_at = Utc::now();
    }

    /// The trailing failures sharing the most recent category, newest
    /// last. Used by the Doctor eligibility check and the re-plan
    /// pattern detector.
    pub fn trailing_same_category(&self) -> Vec<&ErrorRecord> {
        let Some(last) = self.error_history.last() else {
            return Vec::new();
        };
        let mut trailing: Vec<&ErrorRecord> = self
            .error_history
            .iter()
            .rev()
            .take_while(|e| e.category == last.category)
            .collect();
        trailing.reverse();
        trailing
    }
}

/// Aggregate counters persisted on the run row. Monotonic within a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub tokens_consumed: u64,
    pub doctor_invocations: u32,
    pub doctor_strong_invocations: u32,
    pub replans: u32,
    pub attempts: u32,
}

/// Durable runtime state of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub plan: BuildPlan,
    pub plan_hash: String,
    pub state: RunState,
    pub counters: RunCounters,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// First phase that reached FAILED, and why
    pub failure: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: &str, plan: BuildPlan) -> Self {
        let plan_hash = plan.hash();
        Self {
            run_id: run_id.to_string(),
            plan,
            plan_hash,
            state: RunState::Queued,
            counters: RunCounters::default(),
            started_at: Utc::now(),
            ended_at: None,
            failure: None,
        }
    }
}
