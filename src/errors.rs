//! Typed error hierarchy for the Autopack orchestrator.
//!
//! Five top-level enums cover the five taxonomy groups:
//! - `PatchError` — patch parsing and application failures
//! - `GovernanceError` — scope and protection violations
//! - `TestError` — test-gate failures
//! - `WorkflowError` — phase/run lifecycle failures
//! - `InfraError` — external-agent, workspace and persistence failures
//!
//! `FailureCategory` is the closed vocabulary shared by the retry loop,
//! the Doctor eligibility rules and the re-plan trigger.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the patch engine.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Failed to parse patch: {0}")]
    Parse(String),

    #[error("Patch does not apply cleanly to {path}: {reason}")]
    ApplyConflict { path: PathBuf, reason: String },

    #[error("Patch deletes top-level symbol '{symbol}' from {path} without a matching re-create")]
    SymbolDeletion { path: PathBuf, symbol: String },

    #[error(
        "Structural similarity {similarity:.2} for {path} is below the configured minimum {minimum:.2}"
    )]
    StructuralDrift {
        path: PathBuf,
        similarity: f64,
        minimum: f64,
    },

    #[error("Workspace I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Governance(#[from] GovernanceError),
}

/// Errors from the governance decider and the workspace gateway's
/// path policy.
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("Write to {path} is outside the phase scope")]
    ScopeViolation { path: PathBuf },

    #[error("Write to protected path {path} without a matching exception token")]
    ProtectedPathViolation { path: PathBuf },

    #[error("Governance denied the change: {reason}")]
    Denied { reason: String },
}

/// Errors from the test runner and baseline gate.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("{count} test(s) regressed relative to the baseline")]
    NewTestFailure { count: usize, tests: Vec<String> },

    #[error("New collection error in {tests:?}")]
    CollectionError { tests: Vec<String> },

    #[error("Test harness exited with code {exit_code} before producing results")]
    HarnessFailed { exit_code: i32 },
}

/// Errors that terminate a phase or run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Deliverable missing after apply: {paths:?}")]
    DeliverableMissing { paths: Vec<PathBuf> },

    #[error("Phase {phase_id} exhausted its {max_attempts} attempts")]
    ExhaustedAttempts { phase_id: String, max_attempts: u32 },

    #[error("Run budget exhausted: {resource}")]
    ExhaustedBudget { resource: String },

    #[error("Approval request {request_id} timed out")]
    ApprovalTimeout { request_id: String },
}

/// Infrastructure errors. These abort the attempt, roll back the save
/// point and are retried with bounded backoff.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("Agent call to provider {provider} timed out after {seconds}s")]
    AgentTimeout { provider: String, seconds: u64 },

    #[error("Agent provider {provider} failed: {message}")]
    AgentProvider { provider: String, message: String },

    #[error("Workspace I/O error: {0}")]
    WorkspaceIo(#[source] std::io::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// The closed set of failure categories recorded in a phase's error
/// history. Every attempt failure maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    PatchFormatError,
    ApplyConflict,
    ProtectedPathViolation,
    ScopeViolation,
    SymbolDeletion,
    StructuralDrift,
    NewTestFailures,
    CollectionError,
    DeliverablesValidationFailure,
    GovernanceDenied,
    Infrastructure,
    Timeout,
    Logic,
    Unknown,
}

impl FailureCategory {
    /// Tactical categories self-correct through recorded hints; the
    /// Doctor is not consulted for them until attempts are exhausted.
    pub fn is_tactical(&self) -> bool {
        matches!(
            self,
            FailureCategory::DeliverablesValidationFailure | FailureCategory::PatchFormatError
        )
    }

    /// Infrastructure-class failures permit immediate Doctor invocation.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            FailureCategory::Infrastructure | FailureCategory::Timeout
        )
    }

    /// High-risk categories route Doctor diagnosis to the strong model.
    pub fn is_high_risk(&self) -> bool {
        matches!(self, FailureCategory::Logic | FailureCategory::ApplyConflict)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::PatchFormatError => "patch-format-error",
            FailureCategory::ApplyConflict => "apply-conflict",
            FailureCategory::ProtectedPathViolation => "protected-path-violation",
            FailureCategory::ScopeViolation => "scope-violation",
            FailureCategory::SymbolDeletion => "symbol-deletion",
            FailureCategory::StructuralDrift => "structural-drift",
            FailureCategory::NewTestFailures => "new-test-failures",
            FailureCategory::CollectionError => "collection-error",
            FailureCategory::DeliverablesValidationFailure => "deliverables-validation-failure",
            FailureCategory::GovernanceDenied => "governance-denied",
            FailureCategory::Infrastructure => "infrastructure",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Logic => "logic",
            FailureCategory::Unknown => "unknown",
        }
    }

    /// Parse from the kebab-case wire form, falling back to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "patch-format-error" => FailureCategory::PatchFormatError,
            "apply-conflict" => FailureCategory::ApplyConflict,
            "protected-path-violation" => FailureCategory::ProtectedPathViolation,
            "scope-violation" => FailureCategory::ScopeViolation,
            "symbol-deletion" => FailureCategory::SymbolDeletion,
            "structural-drift" => FailureCategory::StructuralDrift,
            "new-test-failures" => FailureCategory::NewTestFailures,
            "collection-error" => FailureCategory::CollectionError,
            "deliverables-validation-failure" => FailureCategory::DeliverablesValidationFailure,
            "governance-denied" => FailureCategory::GovernanceDenied,
            "infrastructure" => FailureCategory::Infrastructure,
            "timeout" => FailureCategory::Timeout,
            "logic" => FailureCategory::Logic,
            _ => FailureCategory::Unknown,
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PatchError {
    /// Map a patch-engine error to its failure category.
    pub fn category(&self) -> FailureCategory {
        match self {
            PatchError::Parse(_) => FailureCategory::PatchFormatError,
            PatchError::ApplyConflict { .. } => FailureCategory::ApplyConflict,
            PatchError::SymbolDeletion { .. } => FailureCategory::SymbolDeletion,
            PatchError::StructuralDrift { .. } => FailureCategory::StructuralDrift,
            PatchError::Io { .. } => FailureCategory::Infrastructure,
            PatchError::Governance(g) => g.category(),
        }
    }
}

impl GovernanceError {
    pub fn category(&self) -> FailureCategory {
        match self {
            GovernanceError::ScopeViolation { .. } => FailureCategory::ScopeViolation,
            GovernanceError::ProtectedPathViolation { .. } => {
                FailureCategory::ProtectedPathViolation
            }
            GovernanceError::Denied { .. } => FailureCategory::GovernanceDenied,
        }
    }
}

impl InfraError {
    pub fn category(&self) -> FailureCategory {
        match self {
            InfraError::AgentTimeout { .. } => FailureCategory::Timeout,
            _ => FailureCategory::Infrastructure,
        }
    }
}
