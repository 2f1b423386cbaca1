//! Phase finalizer: the authoritative completion gate.
//!
//! Combines the deliverable-existence check (against the filesystem,
//! never the patch's claimed file list), the baseline delta, and the
//! governance resolution state into `COMPLETE | BLOCKED | FAILED`.
//! Pre-existing failures never block; only regressions do.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::baseline::DeltaReport;
use crate::errors::FailureCategory;
use crate::patch::ApplyReport;
use crate::phase::PhaseSpec;
use crate::workspace::WorkspaceGateway;

/// Why an attempt did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum BlockReason {
    MissingDeliverables { paths: Vec<PathBuf> },
    CollectionError { tests: Vec<String> },
    NewTestFailures { tests: Vec<String> },
    UnresolvedGovernance { detail: String },
    AuditorBlocked { detail: String },
}

impl BlockReason {
    /// The failure category the retry loop records for this block.
    pub fn category(&self) -> FailureCategory {
        match self {
            BlockReason::MissingDeliverables { .. } => {
                FailureCategory::DeliverablesValidationFailure
            }
            BlockReason::CollectionError { .. } => FailureCategory::CollectionError,
            BlockReason::NewTestFailures { .. } => FailureCategory::NewTestFailures,
            BlockReason::UnresolvedGovernance { .. } => FailureCategory::GovernanceDenied,
            BlockReason::AuditorBlocked { .. } => FailureCategory::Logic,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            BlockReason::MissingDeliverables { paths } => format!(
                "missing deliverables: {}",
                paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            BlockReason::CollectionError { tests } => {
                format!("new collection error(s): {}", tests.join(", "))
            }
            BlockReason::NewTestFailures { tests } => {
                format!("new test failure(s): {}", tests.join(", "))
            }
            BlockReason::UnresolvedGovernance { detail } => {
                format!("unresolved governance: {}", detail)
            }
            BlockReason::AuditorBlocked { detail } => {
                format!("auditor raised blocking issues: {}", detail)
            }
        }
    }
}

/// The finalizer's verdict. `Failed` is reserved for unrecoverable
/// conditions; `Blocked` leaves the retry/Doctor loop in play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum PhaseOutcome {
    Complete,
    Blocked { reason: BlockReason },
    Failed { reason: String },
}

impl PhaseOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, PhaseOutcome::Complete)
    }
}

/// Summary of the attempt's quality state fed into the gate: the
/// unresolved-governance flag and the Auditor's blocking issues.
#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    /// Set when governance returned require-approval and no resolution
    /// was recorded for this attempt
    pub unresolved_approval: Option<String>,
    /// Set when the Auditor raised high-severity issues on the applied
    /// patch
    pub auditor_blocked: Option<String>,
}

impl QualityGate {
    /// Derive the Auditor half of the gate from a quality report:
    /// high or critical issues block completion.
    pub fn from_quality_report(quality: &crate::agents::QualityReport) -> Self {
        let blocking: Vec<&str> = quality
            .issues
            .iter()
            .filter(|issue| {
                matches!(
                    issue.severity.to_ascii_lowercase().as_str(),
                    "high" | "critical"
                )
            })
            .map(|issue| issue.message.as_str())
            .collect();
        Self {
            unresolved_approval: None,
            auditor_blocked: if blocking.is_empty() {
                None
            } else {
                Some(blocking.join("; "))
            },
        }
    }
}

/// The decision procedure.
pub fn finalize(
    spec: &PhaseSpec,
    gateway: &WorkspaceGateway,
    delta: &DeltaReport,
    quality: &QualityGate,
) -> PhaseOutcome {
    // 1. Every deliverable must exist on disk after application.
    let missing: Vec<PathBuf> = spec
        .deliverables
        .iter()
        .map(PathBuf::from)
        .filter(|p| !gateway.exists(p))
        .collect();
    if !missing.is_empty() {
        return PhaseOutcome::Blocked {
            reason: BlockReason::MissingDeliverables { paths: missing },
        };
    }

    // 2. New collection errors always block; pre-existing ones do not
    //    (they never enter the delta as new).
    let collection_errors = delta.new_collection_errors();
    if !collection_errors.is_empty() {
        return PhaseOutcome::Blocked {
            reason: BlockReason::CollectionError {
                tests: collection_errors,
            },
        };
    }

    // 3. Any new failure of any severity blocks; unchanged failures
    //    never do.
    let new_failures = delta.new_failures();
    if !new_failures.is_empty() {
        return PhaseOutcome::Blocked {
            reason: BlockReason::NewTestFailures {
                tests: new_failures,
            },
        };
    }

    // 4. Quality report: an unresolved require-approval blocks, and so
    //    do high-severity Auditor issues.
    if let Some(detail) = &quality.unresolved_approval {
        return PhaseOutcome::Blocked {
            reason: BlockReason::UnresolvedGovernance {
                detail: detail.clone(),
            },
        };
    }
    if let Some(detail) = &quality.auditor_blocked {
        return PhaseOutcome::Blocked {
            reason: BlockReason::AuditorBlocked {
                detail: detail.clone(),
            },
        };
    }

    PhaseOutcome::Complete
}

/// Render the self-correction hint recorded on a deliverables
/// validation failure: points the next Builder attempt from the paths
/// it actually wrote to the paths the phase requires.
pub fn deliverable_hint(missing: &[PathBuf], report: &ApplyReport) -> String {
    let wrote: Vec<String> = report
        .files_created
        .iter()
        .chain(report.files_modified.iter())
        .map(|p| p.display().to_string())
        .collect();

    let mut hint = format!(
        "Deliverables not found after apply: {}.",
        missing
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    for miss in missing {
        let miss_name = miss.file_name().map(|n| n.to_string_lossy().to_string());
        if let Some(name) = miss_name {
            if let Some(actual) = report
                .files_created
                .iter()
                .chain(report.files_modified.iter())
                .find(|p| p.file_name().map(|n| n.to_string_lossy().to_string()) == Some(name.clone()))
            {
                hint.push_str(&format!(
                    " Wrong path: `{}` -> expected `{}`.",
                    actual.display(),
                    miss.display()
                ));
            }
        }
    }

    if !wrote.is_empty() && !hint.contains("Wrong path") {
        hint.push_str(&format!(" Files written instead: {}.", wrote.join(", ")));
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{BaselineReport, DeltaReport, TestRunOutput};
    use crate::phase::Complexity;
    use crate::workspace::PathPolicy;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn spec(deliverables: &[&str]) -> PhaseSpec {
        PhaseSpec {
            id: "01".into(),
            goal: "goal".into(),
            deliverables: deliverables.iter().map(|s| s.to_string()).collect(),
            acceptance_criteria: vec![],
            scope_paths: vec!["src/".into(), "lib/".into()],
            protected_paths: vec![],
            complexity: Complexity::Low,
            dependencies: vec![],
        }
    }

    fn gateway(root: &Path) -> WorkspaceGateway {
        WorkspaceGateway::new(
            root.to_path_buf(),
            PathPolicy::new(vec![], vec![], vec!["src/".into(), "lib/".into()]),
        )
        .unwrap()
    }

    fn clean_delta() -> DeltaReport {
        let baseline = BaselineReport::from_run(&TestRunOutput::parse("pass t::a"));
        DeltaReport::classify(&baseline, &TestRunOutput::parse("pass t::a"))
    }

    #[test]
    fn complete_when_everything_holds() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/greet.py"), "def greet(): return 'hi'\n").unwrap();

        let outcome = finalize(
            &spec(&["lib/greet.py"]),
            &gateway(dir.path()),
            &clean_delta(),
            &QualityGate::default(),
        );
        assert_eq!(outcome, PhaseOutcome::Complete);
    }

    #[test]
    fn missing_deliverable_blocks() {
        let dir = tempdir().unwrap();
        let outcome = finalize(
            &spec(&["src/pkg/util.py"]),
            &gateway(dir.path()),
            &clean_delta(),
            &QualityGate::default(),
        );
        match outcome {
            PhaseOutcome::Blocked {
                reason: BlockReason::MissingDeliverables { paths },
            } => {
                assert_eq!(paths, vec![PathBuf::from("src/pkg/util.py")]);
            }
            other => panic!("expected MissingDeliverables, got {:?}", other),
        }
    }

    #[test]
    fn deliverable_check_uses_filesystem_not_patch_claims() {
        // The patch engine may claim anything; only disk truth counts.
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/util.py"), "x = 1\n").unwrap();

        let outcome = finalize(
            &spec(&["src/pkg/util.py"]),
            &gateway(dir.path()),
            &clean_delta(),
            &QualityGate::default(),
        );
        assert!(matches!(
            outcome,
            PhaseOutcome::Blocked {
                reason: BlockReason::MissingDeliverables { .. }
            }
        ));
    }

    #[test]
    fn new_collection_error_blocks_before_test_failures() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/a.py"), "x\n").unwrap();

        let baseline = BaselineReport::from_run(&TestRunOutput::parse("pass t::a\npass t::b"));
        let delta = DeltaReport::classify(
            &baseline,
            &TestRunOutput::parse("fail t::a\nerror tests/test_new_module.py"),
        );

        let outcome = finalize(
            &spec(&["lib/a.py"]),
            &gateway(dir.path()),
            &delta,
            &QualityGate::default(),
        );
        match outcome {
            PhaseOutcome::Blocked {
                reason: BlockReason::CollectionError { tests },
            } => assert_eq!(tests, vec!["tests/test_new_module.py"]),
            other => panic!("expected CollectionError, got {:?}", other),
        }
    }

    #[test]
    fn preexisting_collection_error_does_not_block() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/a.py"), "x\n").unwrap();

        let baseline =
            BaselineReport::from_run(&TestRunOutput::parse("pass t::a\nerror tests/broken.py"));
        let delta = DeltaReport::classify(
            &baseline,
            &TestRunOutput::parse("pass t::a\nerror tests/broken.py"),
        );

        let outcome = finalize(
            &spec(&["lib/a.py"]),
            &gateway(dir.path()),
            &delta,
            &QualityGate::default(),
        );
        assert_eq!(outcome, PhaseOutcome::Complete);
    }

    #[test]
    fn new_test_failure_blocks_but_unchanged_fail_does_not() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/a.py"), "x\n").unwrap();

        let baseline =
            BaselineReport::from_run(&TestRunOutput::parse("pass t::good\nfail t::already"));

        // Pre-existing failure alone: complete.
        let delta = DeltaReport::classify(
            &baseline,
            &TestRunOutput::parse("pass t::good\nfail t::already"),
        );
        assert_eq!(
            finalize(&spec(&["lib/a.py"]), &gateway(dir.path()), &delta, &QualityGate::default()),
            PhaseOutcome::Complete
        );

        // Regression: blocked.
        let delta = DeltaReport::classify(
            &baseline,
            &TestRunOutput::parse("fail t::good\nfail t::already"),
        );
        match finalize(&spec(&["lib/a.py"]), &gateway(dir.path()), &delta, &QualityGate::default()) {
            PhaseOutcome::Blocked {
                reason: BlockReason::NewTestFailures { tests },
            } => assert_eq!(tests, vec!["t::good"]),
            other => panic!("expected NewTestFailures, got {:?}", other),
        }
    }

    #[test]
    fn unresolved_governance_blocks() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/a.py"), "x\n").unwrap();

        let quality = QualityGate {
            unresolved_approval: Some("large-deletion approval pending".into()),
            auditor_blocked: None,
        };
        let outcome = finalize(&spec(&["lib/a.py"]), &gateway(dir.path()), &clean_delta(), &quality);
        assert!(matches!(
            outcome,
            PhaseOutcome::Blocked {
                reason: BlockReason::UnresolvedGovernance { .. }
            }
        ));
    }

    #[test]
    fn auditor_blocking_issues_gate_completion() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/a.py"), "x\n").unwrap();

        let quality = QualityGate {
            unresolved_approval: None,
            auditor_blocked: Some("unvalidated input reaches the query builder".into()),
        };
        let outcome = finalize(&spec(&["lib/a.py"]), &gateway(dir.path()), &clean_delta(), &quality);
        match outcome {
            PhaseOutcome::Blocked {
                reason: BlockReason::AuditorBlocked { detail },
            } => assert!(detail.contains("query builder")),
            other => panic!("expected AuditorBlocked, got {:?}", other),
        }
    }

    #[test]
    fn quality_gate_derives_from_high_severity_issues_only() {
        use crate::agents::{QualityIssue, QualityReport};

        let report = QualityReport {
            issues: vec![
                QualityIssue {
                    severity: "low".into(),
                    message: "naming nit".into(),
                },
                QualityIssue {
                    severity: "HIGH".into(),
                    message: "drops error handling".into(),
                },
            ],
            ..Default::default()
        };
        let gate = QualityGate::from_quality_report(&report);
        assert_eq!(gate.auditor_blocked.as_deref(), Some("drops error handling"));

        let benign = QualityReport {
            issues: vec![QualityIssue {
                severity: "medium".into(),
                message: "consider a helper".into(),
            }],
            ..Default::default()
        };
        assert!(QualityGate::from_quality_report(&benign)
            .auditor_blocked
            .is_none());
    }

    #[test]
    fn block_reasons_map_to_categories() {
        assert_eq!(
            BlockReason::MissingDeliverables { paths: vec![] }.category(),
            FailureCategory::DeliverablesValidationFailure
        );
        assert_eq!(
            BlockReason::CollectionError { tests: vec![] }.category(),
            FailureCategory::CollectionError
        );
        assert_eq!(
            BlockReason::NewTestFailures { tests: vec![] }.category(),
            FailureCategory::NewTestFailures
        );
        assert_eq!(
            BlockReason::UnresolvedGovernance { detail: String::new() }.category(),
            FailureCategory::GovernanceDenied
        );
        assert_eq!(
            BlockReason::AuditorBlocked { detail: String::new() }.category(),
            FailureCategory::Logic
        );
    }

    #[test]
    fn deliverable_hint_points_to_expected_path() {
        let report = ApplyReport {
            files_created: vec![PathBuf::from("pkg/util.py")],
            ..Default::default()
        };
        let hint = deliverable_hint(&[PathBuf::from("src/pkg/util.py")], &report);
        assert!(hint.contains("Wrong path: `pkg/util.py` -> expected `src/pkg/util.py`"));
    }

    #[test]
    fn deliverable_hint_lists_written_files_without_name_match() {
        let report = ApplyReport {
            files_created: vec![PathBuf::from("src/other.py")],
            ..Default::default()
        };
        let hint = deliverable_hint(&[PathBuf::from("src/pkg/util.py")], &report);
        assert!(hint.contains("Files written instead: src/other.py"));
    }
}
