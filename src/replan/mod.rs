//! Re-plan trigger: detects approach flaws from repeated, similar
//! failures and validates goal-anchored revisions.
//!
//! Error messages are normalized before comparison: absolute paths
//! become `[PATH]`, line numbers `[N]`, timestamps `[T]`, process ids
//! `[PID]`, and the whole message is lowercased. Similarity between
//! normalized messages is `strsim::normalized_levenshtein`; the
//! trigger threshold is inclusive. Embeddings are not used.
//!
//! A revision may change *how* the goal is achieved but must not
//! narrow scope, drop deliverables or remove acceptance criteria, and
//! its description must stay recognizably anchored to the phase's
//! `original_intent`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::agents::RevisedPhase;
use crate::config::Settings;
use crate::phase::PhaseRecord;

/// Minimum similarity between a revised goal and the original intent
/// for the revision to count as anchored. A revision that embeds the
/// intent verbatim always passes.
const INTENT_SIMILARITY_MIN: f64 = 0.3;

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
            .expect("static timestamp pattern")
    })
}

fn pid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:pid|process)[ =:]+\d+").expect("static pid pattern")
    })
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:[A-Za-z]:)?(?:/[\w.\-]+){2,}").expect("static path pattern"))
}

fn line_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(:|\bline )\d+").expect("static line pattern"))
}

/// Mask the variable parts of an error message so repeated failures of
/// the same shape compare as near-identical.
pub fn normalize_message(raw: &str) -> String {
    let masked = timestamp_re().replace_all(raw, "[T]");
    let masked = pid_re().replace_all(&masked, "[PID]");
    let masked = path_re().replace_all(&masked, "[PATH]");
    let masked = line_number_re().replace_all(&masked, "$1[N]");
    masked.to_lowercase().trim().to_string()
}

/// The documented character-level ratio in [0, 1].
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Why a re-plan fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "kebab-case")]
pub enum ReplanCause {
    DoctorRequested,
    ApproachFlaw { similarity: f64 },
    FatalErrorType { matched: String },
}

/// Pattern-based trigger over a phase's error history.
pub struct ReplanTrigger {
    similarity_threshold: f64,
    min_consecutive: usize,
    fatal_error_types: Vec<String>,
}

impl ReplanTrigger {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            similarity_threshold: settings.replan_similarity_threshold,
            min_consecutive: settings.replan_min_consecutive,
            fatal_error_types: settings.fatal_error_types.clone(),
        }
    }

    pub fn new(
        similarity_threshold: f64,
        min_consecutive: usize,
        fatal_error_types: Vec<String>,
    ) -> Self {
        Self {
            similarity_threshold,
            min_consecutive,
            fatal_error_types,
        }
    }

    /// Inspect the error history after a new failure was appended.
    pub fn detect(&self, record: &PhaseRecord) -> Option<ReplanCause> {
        let last = record.error_history.last()?;

        // Fatal error types trigger on first occurrence.
        for fatal in &self.fatal_error_types {
            if last.normalized_message.contains(fatal.as_str())
                || last.category.as_str() == fatal.as_str()
            {
                return Some(ReplanCause::FatalErrorType {
                    matched: fatal.clone(),
                });
            }
        }

        // Approach flaw: the last K consecutive failures share a
        // category and are pairwise similar at or above the threshold.
        let trailing = record.trailing_same_category();
        if trailing.len() < self.min_consecutive {
            return None;
        }
        let window = &trailing[trailing.len() - self.min_consecutive..];
        let mut min_similarity = 1.0f64;
        for pair in window.windows(2) {
            let s = similarity(&pair[0].normalized_message, &pair[1].normalized_message);
            min_similarity = min_similarity.min(s);
        }
        if min_similarity >= self.similarity_threshold {
            return Some(ReplanCause::ApproachFlaw {
                similarity: min_similarity,
            });
        }
        None
    }
}

/// Goal-anchoring acceptance check for a proposed revision. The
/// revised phase may change *how*; it must keep *what*.
pub fn accept_revision(
    record: &PhaseRecord,
    revised: &RevisedPhase,
) -> Result<(), String> {
    let original = &record.spec;

    let revised_deliverables: HashSet<&str> =
        revised.deliverables.iter().map(|s| s.as_str()).collect();
    for deliverable in &original.deliverables {
        if !revised_deliverables.contains(deliverable.as_str()) {
            return Err(format!("revision drops deliverable {}", deliverable));
        }
    }

    let revised_scope: HashSet<&str> = revised.scope_paths.iter().map(|s| s.as_str()).collect();
    for scope in &original.scope_paths {
        if !revised_scope.contains(scope.as_str()) {
            return Err(format!("revision narrows scope: {} removed", scope));
        }
    }

    let revised_criteria: HashSet<&str> = revised
        .acceptance_criteria
        .iter()
        .map(|s| s.as_str())
        .collect();
    for criterion in &original.acceptance_criteria {
        if !revised_criteria.contains(criterion.as_str()) {
            return Err(format!("revision removes acceptance criterion: {}", criterion));
        }
    }

    let anchored = revised.goal.contains(&record.original_intent)
        || similarity(
            &revised.goal.to_lowercase(),
            &record.original_intent.to_lowercase(),
        ) >= INTENT_SIMILARITY_MIN;
    if !anchored {
        return Err("revised goal is not anchored to the original intent".into());
    }

    Ok(())
}

/// Apply an accepted revision to the phase record. The caller resets
/// the retry counters and persists.
pub fn apply_revision(record: &mut PhaseRecord, revised: RevisedPhase) {
    record.spec.goal = revised.goal;
    record.spec.deliverables = revised.deliverables;
    record.spec.acceptance_criteria = revised.acceptance_criteria;
    record.spec.scope_paths = revised.scope_paths;
    record.replans += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureCategory;
    use crate::phase::{Complexity, ErrorRecord, PhaseSpec};

    fn spec() -> PhaseSpec {
        PhaseSpec {
            id: "01".into(),
            goal: "integrate the payments library".into(),
            deliverables: vec!["src/payments.py".into()],
            acceptance_criteria: vec!["charges succeed".into()],
            scope_paths: vec!["src/".into()],
            protected_paths: vec![],
            complexity: Complexity::Medium,
            dependencies: vec![],
        }
    }

    fn trigger() -> ReplanTrigger {
        ReplanTrigger::new(0.8, 2, vec!["wrong-tech-stack".into(), "schema-mismatch".into()])
    }

    // =========================================
    // Normalization
    // =========================================

    #[test]
    fn normalize_masks_paths_lines_timestamps_and_pids() {
        let raw = "ModuleNotFoundError: no module named 'requests' at /home/user/project/src/api.py:42";
        let normalized = normalize_message(raw);
        assert_eq!(
            normalized,
            "modulenotfounderror: no module named 'requests' at [path]:[n]"
        );

        let raw = "worker crashed at 2026-07-31T12:30:05Z (pid 4242) on line 17";
        let normalized = normalize_message(raw);
        assert!(normalized.contains("[t]"));
        assert!(normalized.contains("[pid]"));
        assert!(normalized.contains("line [n]"));
    }

    #[test]
    fn normalize_makes_same_shape_errors_identical() {
        let a = normalize_message("ImportError at /tmp/run-1/src/mod.py:10");
        let b = normalize_message("ImportError at /var/lib/run-2/src/mod.py:93");
        assert_eq!(a, b);
        assert_eq!(similarity(&a, &b), 1.0);
    }

    // =========================================
    // Trigger detection
    // =========================================

    fn failed_record(messages: &[&str]) -> PhaseRecord {
        let mut record = PhaseRecord::new("run-1", spec());
        for msg in messages {
            record.record_failure(ErrorRecord::new(
                FailureCategory::Logic,
                normalize_message(msg),
            ));
        }
        record
    }

    #[test]
    fn identical_consecutive_failures_trigger() {
        let record = failed_record(&[
            "ModuleNotFoundError: no module named 'x' at /a/b/c.py:1",
            "ModuleNotFoundError: no module named 'x' at /d/e/f.py:9",
        ]);
        match trigger().detect(&record) {
            Some(ReplanCause::ApproachFlaw { similarity }) => assert_eq!(similarity, 1.0),
            other => panic!("expected ApproachFlaw, got {:?}", other),
        }
    }

    #[test]
    fn single_failure_does_not_trigger() {
        let record = failed_record(&["ModuleNotFoundError: no module named 'x'"]);
        assert_eq!(trigger().detect(&record), None);
    }

    #[test]
    fn dissimilar_failures_do_not_trigger() {
        let record = failed_record(&[
            "ModuleNotFoundError: no module named 'x'",
            "assertion failed: expected 3 rows, found 0",
        ]);
        assert_eq!(trigger().detect(&record), None);
    }

    #[test]
    fn category_change_resets_the_window() {
        let mut record = failed_record(&["ModuleNotFoundError: no module named 'x'"]);
        record.record_failure(ErrorRecord::new(
            FailureCategory::NewTestFailures,
            normalize_message("ModuleNotFoundError: no module named 'x'"),
        ));
        // Same message but different categories: not an approach flaw.
        assert_eq!(trigger().detect(&record), None);
    }

    #[test]
    fn similarity_exactly_at_threshold_triggers() {
        // Inclusive boundary: craft a trigger with threshold equal to
        // the exact similarity of the two messages.
        let a = "error in module alpha";
        let b = "error in module alphb";
        let s = similarity(a, b);
        let exact = ReplanTrigger::new(s, 2, vec![]);
        let record = failed_record(&[a, b]);
        assert!(matches!(
            exact.detect(&record),
            Some(ReplanCause::ApproachFlaw { .. })
        ));

        // Just above the boundary does not trigger.
        let above = ReplanTrigger::new(s + 1e-9, 2, vec![]);
        assert_eq!(above.detect(&record), None);
    }

    #[test]
    fn fatal_error_type_triggers_on_first_occurrence() {
        let record = failed_record(&["detected wrong-tech-stack: project uses poetry not pip"]);
        match trigger().detect(&record) {
            Some(ReplanCause::FatalErrorType { matched }) => {
                assert_eq!(matched, "wrong-tech-stack");
            }
            other => panic!("expected FatalErrorType, got {:?}", other),
        }
    }

    // =========================================
    // Revision acceptance
    // =========================================

    fn revision(goal: &str) -> RevisedPhase {
        RevisedPhase {
            goal: goal.into(),
            deliverables: vec!["src/payments.py".into()],
            acceptance_criteria: vec!["charges succeed".into()],
            scope_paths: vec!["src/".into()],
        }
    }

    #[test]
    fn revision_keeping_everything_is_accepted() {
        let record = PhaseRecord::new("run-1", spec());
        let revised = revision("integrate the payments library using the stdlib http client");
        assert!(accept_revision(&record, &revised).is_ok());
    }

    #[test]
    fn revision_dropping_deliverable_is_rejected() {
        let record = PhaseRecord::new("run-1", spec());
        let mut revised = revision("integrate the payments library differently");
        revised.deliverables = vec!["src/other.py".into()];
        let err = accept_revision(&record, &revised).unwrap_err();
        assert!(err.contains("drops deliverable"));
    }

    #[test]
    fn revision_may_add_deliverables() {
        let record = PhaseRecord::new("run-1", spec());
        let mut revised = revision("integrate the payments library with a wrapper module");
        revised.deliverables.push("src/payments_compat.py".into());
        assert!(accept_revision(&record, &revised).is_ok());
    }

    #[test]
    fn revision_narrowing_scope_is_rejected() {
        let record = PhaseRecord::new("run-1", spec());
        let mut revised = revision("integrate the payments library differently");
        revised.scope_paths = vec![];
        let err = accept_revision(&record, &revised).unwrap_err();
        assert!(err.contains("narrows scope"));
    }

    #[test]
    fn revision_removing_criterion_is_rejected() {
        let record = PhaseRecord::new("run-1", spec());
        let mut revised = revision("integrate the payments library differently");
        revised.acceptance_criteria = vec![];
        let err = accept_revision(&record, &revised).unwrap_err();
        assert!(err.contains("acceptance criterion"));
    }

    #[test]
    fn unanchored_goal_is_rejected() {
        let record = PhaseRecord::new("run-1", spec());
        let revised = revision("rewrite the frontend in a different framework");
        let err = accept_revision(&record, &revised).unwrap_err();
        assert!(err.contains("not anchored"));
    }

    #[test]
    fn apply_revision_preserves_original_intent() {
        let mut record = PhaseRecord::new("run-1", spec());
        let intent = record.original_intent.clone();
        apply_revision(
            &mut record,
            revision("integrate the payments library via its REST API"),
        );
        assert_eq!(record.original_intent, intent);
        assert_eq!(record.replans, 1);
        assert!(record.spec.goal.contains("REST API"));
    }
}
