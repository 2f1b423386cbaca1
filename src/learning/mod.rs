//! Learning store: durable learned rules and run-scoped hints.
//!
//! Learned rules are cross-run patterns matched by a scope glob or a
//! category tag; run hints are ephemeral corrections recorded during a
//! run (wrong deliverable paths, malformed patches) and discarded when
//! the run terminates. A hint that recurs unchanged across enough
//! successful attempts becomes a promotion candidate; promotion itself
//! is applied by an external process.
//!
//! The store is side-effect-free with respect to execution: it only
//! supplies text appended to Builder/Auditor context.

use anyhow::Result;
use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::store::Store;

/// Wildcard phase id for hints that apply to every phase of a run.
pub const ANY_PHASE: &str = "*";

/// A durable, cross-run rule applied to Builder context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedRule {
    /// Short identifier, unique across the store
    pub rule_id: String,
    /// Path glob (e.g. `src/**/*.py`) or category tag (e.g.
    /// `category:migration`)
    pub scope: String,
    /// Text appended to Builder context when the rule matches
    pub body: String,
    pub confidence: f64,
    pub occurrences: u32,
    pub last_seen: DateTime<Utc>,
}

impl LearnedRule {
    /// Whether this rule applies to a phase with the given scope paths
    /// and category.
    pub fn matches(&self, scope_paths: &[String], category: Option<&str>) -> bool {
        if let Some(tag) = self.scope.strip_prefix("category:") {
            return category == Some(tag);
        }
        let pattern = Pattern::new(&self.scope).ok();
        let rule_scope = self.scope.trim_end_matches('/');
        let rule_root = rule_scope.trim_end_matches("/**").trim_end_matches('/');

        scope_paths.iter().any(|p| {
            let phase_path = p.trim_end_matches('/');
            // Direct glob match of the phase path against the rule.
            if pattern
                .as_ref()
                .map(|pat| pat.matches(phase_path))
                .unwrap_or(false)
            {
                return true;
            }
            // A rule rooted beneath the phase's prefix applies (the
            // phase owns `src/`, the rule covers `src/pkg/*.py`), as
            // does a rule whose root contains the phase path.
            rule_scope == phase_path
                || rule_scope.starts_with(&format!("{}/", phase_path))
                || phase_path.starts_with(&format!("{}/", rule_root))
        })
    }
}

/// A run-scoped hint with the same shape as a learned rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHint {
    pub run_id: String,
    /// A phase id, or [`ANY_PHASE`]
    pub phase_id: String,
    pub body: String,
    /// Successful attempts this hint has survived unchanged
    pub successes: u32,
    pub created_at: DateTime<Utc>,
}

/// Retrieval facade over the persistent store.
pub struct LearningStore {
    store: Arc<Store>,
    promotion_min_occurrences: u32,
}

impl LearningStore {
    pub fn new(store: Arc<Store>, promotion_min_occurrences: u32) -> Self {
        Self {
            store,
            promotion_min_occurrences,
        }
    }

    /// Rules whose scope matches any of the phase's scope paths or its
    /// category.
    pub fn rules_for_phase(
        &self,
        scope_paths: &[String],
        category: Option<&str>,
    ) -> Result<Vec<LearnedRule>> {
        let all = self.store.list_learned_rules()?;
        Ok(all
            .into_iter()
            .filter(|r| r.matches(scope_paths, category))
            .collect())
    }

    /// Hints for the given phase plus wildcard hints of the same run.
    pub fn hints_for_phase(&self, run_id: &str, phase_id: &str) -> Result<Vec<RunHint>> {
        self.store.hints_for_phase(run_id, phase_id)
    }

    /// Record a hint for one phase of a run. Re-recording the same
    /// body is idempotent.
    pub fn record_hint(&self, run_id: &str, phase_id: &str, body: &str) -> Result<()> {
        self.store.add_run_hint(run_id, phase_id, body)
    }

    /// Mark the phase's hints as having survived a successful attempt.
    pub fn mark_hints_successful(&self, run_id: &str, phase_id: &str) -> Result<()> {
        self.store.increment_hint_successes(run_id, phase_id)
    }

    /// Hints eligible for promotion to learned rules. Promotion is not
    /// automatic: this is a candidate list for an external process.
    pub fn promotion_candidates(&self, run_id: &str) -> Result<Vec<RunHint>> {
        let hints = self.store.all_run_hints(run_id)?;
        Ok(hints
            .into_iter()
            .filter(|h| h.successes >= self.promotion_min_occurrences)
            .collect())
    }

    /// Drop every hint of a terminated run.
    pub fn discard_run(&self, run_id: &str) -> Result<()> {
        self.store.delete_run_hints(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(scope: &str) -> LearnedRule {
        LearnedRule {
            rule_id: "r1".into(),
            scope: scope.into(),
            body: "always use absolute imports".into(),
            confidence: 0.9,
            occurrences: 4,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn glob_scope_matches_phase_paths() {
        let r = rule("src/**");
        assert!(r.matches(&["src/".to_string()], None));
        assert!(r.matches(&["src/pkg/util.py".to_string()], None));
        assert!(!r.matches(&["docs/".to_string()], None));
    }

    #[test]
    fn exact_scope_matches() {
        let r = rule("lib/greet.py");
        assert!(r.matches(&["lib/greet.py".to_string()], None));
        assert!(!r.matches(&["lib/other.py".to_string()], None));
    }

    #[test]
    fn phase_prefix_covers_narrower_rule_scope() {
        // Phase scoped to src/ retrieves rules scoped to files under it.
        let r = rule("src/pkg/*.py");
        assert!(r.matches(&["src/".to_string()], None));
    }

    #[test]
    fn category_scope_matches_tag_only() {
        let r = rule("category:migration");
        assert!(r.matches(&[], Some("migration")));
        assert!(!r.matches(&[], Some("scaffold")));
        assert!(!r.matches(&["src/".to_string()], None));
    }

    #[test]
    fn invalid_glob_never_matches() {
        let r = rule("[invalid");
        assert!(!r.matches(&["src/".to_string()], None));
    }

    #[test]
    fn promotion_candidates_need_enough_successes() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let learning = LearningStore::new(Arc::clone(&store), 3);

        learning.record_hint("run-1", "01", "use src/ root").unwrap();
        learning.record_hint("run-1", "01", "one-off correction").unwrap();

        for _ in 0..3 {
            learning.mark_hints_successful("run-1", "01").unwrap();
        }

        let candidates = learning.promotion_candidates("run-1").unwrap();
        let bodies: Vec<&str> = candidates.iter().map(|h| h.body.as_str()).collect();
        assert!(bodies.contains(&"use src/ root"));
        // Both hints share the phase, so both accumulated successes.
        assert_eq!(candidates.len(), 2);

        learning.discard_run("run-1").unwrap();
        assert!(learning.promotion_candidates("run-1").unwrap().is_empty());
    }

    #[test]
    fn rules_for_phase_filters_by_scope() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let learning = LearningStore::new(Arc::clone(&store), 3);

        store
            .upsert_learned_rule(&LearnedRule {
                rule_id: "r-src".into(),
                scope: "src/**".into(),
                body: "src rule".into(),
                confidence: 0.8,
                occurrences: 5,
                last_seen: Utc::now(),
            })
            .unwrap();
        store
            .upsert_learned_rule(&LearnedRule {
                rule_id: "r-docs".into(),
                scope: "docs/**".into(),
                body: "docs rule".into(),
                confidence: 0.8,
                occurrences: 5,
                last_seen: Utc::now(),
            })
            .unwrap();

        let rules = learning
            .rules_for_phase(&["src/".to_string()], None)
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].body, "src rule");
    }
}
