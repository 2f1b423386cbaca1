//! Baseline capture and delta-based test classification.
//!
//! The baseline (T0) is the set of test outcomes captured at run
//! start. Completion gating is delta-based: only *new* failures block,
//! never failures already present at T0. The baseline is a mutable
//! watermark of pre-existing failures: a test fixed by a finalized
//! phase moves from the fail set to the pass set for the remainder of
//! the run.

mod runner;

pub use runner::{TestRunOutput, TestRunner};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// The captured baseline: pass set P0, fail set F0, collection-error
/// set E0, plus a hash of the discovery output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineReport {
    pub passed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub errored: BTreeSet<String>,
    pub discovery_hash: String,
    pub captured_at: DateTime<Utc>,
}

impl BaselineReport {
    /// Build the baseline from a full-suite run. A collection error at
    /// T0 does not block the run; it is annotated here.
    pub fn from_run(output: &TestRunOutput) -> Self {
        Self {
            passed: output.passed.clone(),
            failed: output.failed.clone(),
            errored: output.errored.clone(),
            discovery_hash: discovery_hash(output),
            captured_at: Utc::now(),
        }
    }

    pub fn has_collection_errors(&self) -> bool {
        !self.errored.is_empty()
    }

    /// Move fixed tests from F0 to P0. Called only when the fixing
    /// phase finalizes COMPLETE.
    pub fn absorb_fixed(&mut self, fixed: &BTreeSet<String>) {
        for test in fixed {
            if self.failed.remove(test) {
                self.passed.insert(test.clone());
            }
        }
    }
}

/// SHA-256 over the sorted set of discovered test identifiers.
pub fn discovery_hash(output: &TestRunOutput) -> String {
    let mut hasher = Sha256::new();
    for id in output
        .passed
        .iter()
        .chain(output.failed.iter())
        .chain(output.errored.iter())
        .collect::<BTreeSet<_>>()
    {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Classification of one test relative to the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeltaClass {
    UnchangedPass,
    UnchangedFail,
    NewFail,
    Fixed,
    Flaky,
    CollectionError,
}

/// Per-attempt classification of every test against the baseline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaReport {
    pub classifications: BTreeMap<String, DeltaClass>,
}

impl DeltaReport {
    /// Classify a run against the baseline. Flaky demotion happens
    /// afterwards via [`DeltaReport::mark_flaky`], once the confirming
    /// re-run is available.
    pub fn classify(baseline: &BaselineReport, current: &TestRunOutput) -> Self {
        let mut classifications = BTreeMap::new();

        for test in &current.errored {
            if baseline.errored.contains(test) {
                // Pre-existing collection error, annotated at T0.
                continue;
            }
            classifications.insert(test.clone(), DeltaClass::CollectionError);
        }

        for test in &current.passed {
            let class = if baseline.failed.contains(test) {
                DeltaClass::Fixed
            } else {
                DeltaClass::UnchangedPass
            };
            classifications.insert(test.clone(), class);
        }

        for test in &current.failed {
            let class = if baseline.passed.contains(test) {
                DeltaClass::NewFail
            } else {
                // In F0, or a test the baseline never saw. Either way
                // it is not a regression of the expected-pass set.
                DeltaClass::UnchangedFail
            };
            classifications.insert(test.clone(), class);
        }

        Self { classifications }
    }

    /// Demote the given tests from `new-fail` to `flaky` after the
    /// confirming re-run saw them pass.
    pub fn mark_flaky(&mut self, tests: &BTreeSet<String>) {
        for test in tests {
            if let Some(class) = self.classifications.get_mut(test) {
                if *class == DeltaClass::NewFail {
                    *class = DeltaClass::Flaky;
                }
            }
        }
    }

    fn tests_with(&self, wanted: DeltaClass) -> Vec<String> {
        self.classifications
            .iter()
            .filter(|(_, c)| **c == wanted)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Regressions that gate completion. Flaky tests are excluded.
    pub fn new_failures(&self) -> Vec<String> {
        self.tests_with(DeltaClass::NewFail)
    }

    /// New collection errors; always blocking.
    pub fn new_collection_errors(&self) -> Vec<String> {
        self.tests_with(DeltaClass::CollectionError)
    }

    pub fn fixed(&self) -> BTreeSet<String> {
        self.classifications
            .iter()
            .filter(|(_, c)| **c == DeltaClass::Fixed)
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn flaky(&self) -> Vec<String> {
        self.tests_with(DeltaClass::Flaky)
    }

    /// True when nothing blocks: no new failures, no new collection
    /// errors.
    pub fn is_clean(&self) -> bool {
        self.new_failures().is_empty() && self.new_collection_errors().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(pass: &[&str], fail: &[&str], error: &[&str]) -> TestRunOutput {
        TestRunOutput {
            passed: pass.iter().map(|s| s.to_string()).collect(),
            failed: fail.iter().map(|s| s.to_string()).collect(),
            errored: error.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn baseline_captures_sets_and_hash() {
        let baseline = BaselineReport::from_run(&output(&["a", "b"], &["c"], &["d"]));
        assert_eq!(baseline.passed.len(), 2);
        assert_eq!(baseline.failed.len(), 1);
        assert_eq!(baseline.errored.len(), 1);
        assert!(!baseline.discovery_hash.is_empty());
        assert!(baseline.has_collection_errors());
    }

    #[test]
    fn discovery_hash_is_order_insensitive_and_content_sensitive() {
        let h1 = discovery_hash(&output(&["a", "b"], &["c"], &[]));
        let h2 = discovery_hash(&output(&["b", "a"], &["c"], &[]));
        assert_eq!(h1, h2);

        let h3 = discovery_hash(&output(&["a", "b"], &["d"], &[]));
        assert_ne!(h1, h3);
    }

    #[test]
    fn classify_new_fail_iff_in_p0_and_now_failing() {
        let baseline = BaselineReport::from_run(&output(&["a", "b"], &["c"], &[]));
        let delta = DeltaReport::classify(&baseline, &output(&["b"], &["a", "c"], &[]));

        assert_eq!(delta.classifications["a"], DeltaClass::NewFail);
        assert_eq!(delta.classifications["b"], DeltaClass::UnchangedPass);
        assert_eq!(delta.classifications["c"], DeltaClass::UnchangedFail);
        assert_eq!(delta.new_failures(), vec!["a"]);
    }

    #[test]
    fn classify_fixed_when_f0_test_passes() {
        let baseline = BaselineReport::from_run(&output(&["a"], &["c"], &[]));
        let delta = DeltaReport::classify(&baseline, &output(&["a", "c"], &[], &[]));

        assert_eq!(delta.classifications["c"], DeltaClass::Fixed);
        assert_eq!(delta.fixed().len(), 1);
        assert!(delta.is_clean());
    }

    #[test]
    fn brand_new_failing_test_is_not_a_regression() {
        // The new-fail invariant: in P0 and currently failing. A test
        // the baseline never saw cannot regress the expected-pass set.
        let baseline = BaselineReport::from_run(&output(&["a"], &[], &[]));
        let delta = DeltaReport::classify(&baseline, &output(&["a"], &["fresh"], &[]));
        assert_eq!(delta.classifications["fresh"], DeltaClass::UnchangedFail);
        assert!(delta.is_clean());
    }

    #[test]
    fn preexisting_collection_error_does_not_block() {
        let baseline = BaselineReport::from_run(&output(&["a"], &[], &["mod_x"]));
        let delta = DeltaReport::classify(&baseline, &output(&["a"], &[], &["mod_x"]));
        assert!(delta.new_collection_errors().is_empty());
        assert!(delta.is_clean());
    }

    #[test]
    fn new_collection_error_blocks() {
        let baseline = BaselineReport::from_run(&output(&["a"], &[], &[]));
        let delta = DeltaReport::classify(&baseline, &output(&["a"], &[], &["mod_y"]));
        assert_eq!(delta.new_collection_errors(), vec!["mod_y"]);
        assert!(!delta.is_clean());
    }

    #[test]
    fn mark_flaky_excludes_from_new_failures() {
        let baseline = BaselineReport::from_run(&output(&["a", "b"], &[], &[]));
        let mut delta = DeltaReport::classify(&baseline, &output(&["b"], &["a"], &[]));
        assert_eq!(delta.new_failures(), vec!["a"]);

        delta.mark_flaky(&["a".to_string()].into_iter().collect());
        assert!(delta.new_failures().is_empty());
        assert_eq!(delta.flaky(), vec!["a"]);
        assert!(delta.is_clean());
    }

    #[test]
    fn mark_flaky_only_touches_new_fails() {
        let baseline = BaselineReport::from_run(&output(&["a"], &["c"], &[]));
        let mut delta = DeltaReport::classify(&baseline, &output(&["a"], &["c"], &[]));
        delta.mark_flaky(&["c".to_string()].into_iter().collect());
        assert_eq!(delta.classifications["c"], DeltaClass::UnchangedFail);
    }

    #[test]
    fn absorb_fixed_moves_watermark() {
        let mut baseline = BaselineReport::from_run(&output(&["a"], &["c", "d"], &[]));
        baseline.absorb_fixed(&["c".to_string()].into_iter().collect());

        assert!(baseline.passed.contains("c"));
        assert!(!baseline.failed.contains("c"));
        assert!(baseline.failed.contains("d"));

        // After absorption, a re-failure of "c" is a regression.
        let delta = DeltaReport::classify(&baseline, &output(&["a"], &["c", "d"], &[]));
        assert_eq!(delta.classifications["c"], DeltaClass::NewFail);
        assert_eq!(delta.classifications["d"], DeltaClass::UnchangedFail);
    }

    #[test]
    fn absorb_fixed_ignores_tests_not_in_f0() {
        let mut baseline = BaselineReport::from_run(&output(&["a"], &[], &[]));
        baseline.absorb_fixed(&["unknown".to_string()].into_iter().collect());
        assert!(!baseline.passed.contains("unknown"));
    }
}
