//! Governance decider: a pure function over a (prospective or applied)
//! patch report, the Auditor's risk flags, and phase context.
//!
//! Rules are evaluated in order; the first match wins:
//! 1. protected-path write without a matching exception token -> deny
//! 2. out-of-scope write without a token -> require-approval
//! 3. net deletion above the hard threshold -> deny
//! 4. net deletion at or above the approval threshold -> require-approval
//! 5. structural drift -> require-approval
//! 6. symbol deletion -> require-approval
//! 7. Auditor risk flags present -> require-approval
//! 8. otherwise -> allow
//!
//! Token-covered paths are respected silently (they never reach rules
//! 1 and 2), and an approval already granted for a rule's reason
//! suppresses that rule for the rest of the attempt. The decider is
//! stateless; callers record the decision in the phase's audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::patch::ApplyReport;
use crate::workspace::ExceptionToken;

/// Why approval is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalReason {
    ScopeException,
    LargeDeletion,
    StructuralDrift,
    SymbolDeletion,
    RiskyPatch,
}

impl ApprovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalReason::ScopeException => "scope-exception",
            ApprovalReason::LargeDeletion => "large-deletion",
            ApprovalReason::StructuralDrift => "structural-drift",
            ApprovalReason::SymbolDeletion => "symbol-deletion",
            ApprovalReason::RiskyPatch => "risky-patch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// The decider's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum Decision {
    Allow,
    RequireApproval {
        reason: ApprovalReason,
        severity: Severity,
        detail: String,
        /// Paths an exception token would need to cover
        paths: Vec<PathBuf>,
    },
    Deny {
        reason: String,
    },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Context the decider needs beyond the report itself.
#[derive(Debug, Clone)]
pub struct GovernanceContext<'a> {
    /// Exception tokens already granted for this phase
    pub tokens: &'a [ExceptionToken],
    /// Approval reasons already granted for this attempt; the matching
    /// rules are respected silently
    pub granted: &'a [ApprovalReason],
    /// Risk flags raised by the Auditor on the applied patch (empty
    /// before the Auditor has run)
    pub auditor_risk_flags: &'a [String],
    pub deletion_approval_threshold_lines: usize,
    pub deletion_deny_threshold_lines: usize,
}

/// A recorded decision, appended to the phase's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceEvent {
    pub decision: Decision,
    /// Short name of the rule that fired
    pub rule: String,
    pub timestamp: DateTime<Utc>,
}

impl GovernanceEvent {
    pub fn new(decision: Decision, rule: impl Into<String>) -> Self {
        Self {
            decision,
            rule: rule.into(),
            timestamp: Utc::now(),
        }
    }
}

fn uncovered(paths: &[PathBuf], tokens: &[ExceptionToken]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter(|p| !tokens.iter().any(|t| t.covers(p)))
        .cloned()
        .collect()
}

/// The decision function. Stateless; all context arrives as arguments.
pub fn decide(report: &ApplyReport, ctx: &GovernanceContext) -> Decision {
    // Rule 1: protected writes without a token are denied outright.
    let protected = uncovered(&report.protected_targets, ctx.tokens);
    if !protected.is_empty() {
        return Decision::Deny {
            reason: format!(
                "write to protected path(s) without exception token: {}",
                join_paths(&protected)
            ),
        };
    }

    // Rule 2: out-of-scope writes need a scope exception.
    let out_of_scope = uncovered(&report.out_of_scope_targets, ctx.tokens);
    if !out_of_scope.is_empty() {
        return Decision::RequireApproval {
            reason: ApprovalReason::ScopeException,
            severity: Severity::Medium,
            detail: format!("write outside phase scope: {}", join_paths(&out_of_scope)),
            paths: out_of_scope,
        };
    }

    // Rules 3 and 4: net deletion thresholds. The approval boundary is
    // inclusive; the deny boundary is strict.
    let net = report.net_deletion();
    if net > ctx.deletion_deny_threshold_lines {
        return Decision::Deny {
            reason: format!(
                "net deletion of {} lines exceeds the hard limit of {}",
                net, ctx.deletion_deny_threshold_lines
            ),
        };
    }
    if net >= ctx.deletion_approval_threshold_lines
        && !ctx.granted.contains(&ApprovalReason::LargeDeletion)
    {
        return Decision::RequireApproval {
            reason: ApprovalReason::LargeDeletion,
            severity: Severity::High,
            detail: format!(
                "net deletion of {} lines (approval threshold {})",
                net, ctx.deletion_approval_threshold_lines
            ),
            paths: report.files_deleted.clone(),
        };
    }

    // Rule 5: structural drift.
    if !ctx.granted.contains(&ApprovalReason::StructuralDrift) {
        if let Some(flag) = report.structural_drift.first() {
            return Decision::RequireApproval {
                reason: ApprovalReason::StructuralDrift,
                severity: Severity::Medium,
                detail: format!(
                    "{} retains only {:.0}% of its structure",
                    flag.path.display(),
                    flag.similarity * 100.0
                ),
                paths: report.structural_drift.iter().map(|f| f.path.clone()).collect(),
            };
        }
    }

    // Rule 6: symbol deletion without re-creation.
    if !ctx.granted.contains(&ApprovalReason::SymbolDeletion) {
        if let Some(flag) = report.symbol_deletions.first() {
            return Decision::RequireApproval {
                reason: ApprovalReason::SymbolDeletion,
                severity: Severity::Medium,
                detail: format!(
                    "top-level symbol '{}' deleted from {}",
                    flag.symbol,
                    flag.path.display()
                ),
                paths: report.symbol_deletions.iter().map(|f| f.path.clone()).collect(),
            };
        }
    }

    // Rule 7: the Auditor flagged the applied patch as risky.
    if !ctx.auditor_risk_flags.is_empty() && !ctx.granted.contains(&ApprovalReason::RiskyPatch) {
        return Decision::RequireApproval {
            reason: ApprovalReason::RiskyPatch,
            severity: Severity::High,
            detail: format!("auditor risk flags: {}", ctx.auditor_risk_flags.join(", ")),
            paths: Vec::new(),
        };
    }

    Decision::Allow
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
