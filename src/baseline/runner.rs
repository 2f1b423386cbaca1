//! Test harness execution.
//!
//! The harness is an external command configured per project. Its
//! contract is line-oriented: one line per test, `pass <id>`,
//! `fail <id>` or `error <id>` (collection error). Anything else on
//! stdout is ignored. A selection of test ids may be appended as
//! arguments to re-run a subset.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::errors::TestError;

use super::{BaselineReport, DeltaReport};

/// Parsed output of one harness invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestRunOutput {
    pub passed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub errored: BTreeSet<String>,
}

impl TestRunOutput {
    /// Parse the line-oriented harness contract.
    pub fn parse(raw: &str) -> Self {
        let mut output = Self::default();
        for line in raw.lines() {
            let mut parts = line.split_whitespace();
            let (Some(status), Some(id)) = (parts.next(), parts.next()) else {
                continue;
            };
            match status.to_ascii_lowercase().as_str() {
                "pass" => {
                    output.passed.insert(id.to_string());
                }
                "fail" => {
                    output.failed.insert(id.to_string());
                }
                "error" => {
                    output.errored.insert(id.to_string());
                }
                _ => {}
            }
        }
        output
    }

    pub fn total(&self) -> usize {
        self.passed.len() + self.failed.len() + self.errored.len()
    }
}

/// Runs the configured test harness and classifies results against the
/// baseline.
pub struct TestRunner {
    harness_cmd: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl TestRunner {
    pub fn new(harness_cmd: Vec<String>, workdir: PathBuf, timeout: Duration) -> Self {
        Self {
            harness_cmd,
            workdir,
            timeout,
        }
    }

    /// One harness invocation, optionally restricted to a selection of
    /// test ids.
    pub async fn run(&self, selection: Option<&[String]>) -> Result<TestRunOutput> {
        let (program, args) = self
            .harness_cmd
            .split_first()
            .context("harness command is empty")?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(tests) = selection {
            cmd.args(tests);
        }
        cmd.current_dir(&self.workdir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let output = tokio::time::timeout(self.timeout, async {
            cmd.output().await.context("Failed to spawn test harness")
        })
        .await
        .map_err(|_| anyhow::anyhow!("test harness timed out after {:?}", self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed = TestRunOutput::parse(&stdout);
        debug!(
            tests = parsed.total(),
            failed = parsed.failed.len(),
            errors = parsed.errored.len(),
            "test harness run complete"
        );

        // A harness that produced no results and exited nonzero did
        // not run the suite at all.
        if parsed.total() == 0 && !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(TestError::HarnessFailed { exit_code }.into());
        }

        Ok(parsed)
    }

    /// Capture the run-start baseline (T0) with a full-suite run.
    pub async fn capture_baseline(&self) -> Result<BaselineReport> {
        let output = self.run(None).await?;
        Ok(BaselineReport::from_run(&output))
    }

    /// Post-apply attempt run: full suite, classify against the
    /// baseline, then confirm any new failures with an immediate
    /// re-run of just those tests. A test that passes the re-run is
    /// flaky: recorded, excluded from gating.
    pub async fn run_attempt(&self, baseline: &BaselineReport) -> Result<DeltaReport> {
        let output = self.run(None).await?;
        let mut delta = DeltaReport::classify(baseline, &output);

        let new_failures = delta.new_failures();
        if !new_failures.is_empty() {
            let rerun = self.run(Some(&new_failures)).await?;
            let now_passing: BTreeSet<String> = new_failures
                .iter()
                .filter(|t| rerun.passed.contains(*t))
                .cloned()
                .collect();
            if !now_passing.is_empty() {
                debug!(flaky = now_passing.len(), "confirming re-run demoted flaky tests");
                delta.mark_flaky(&now_passing);
            }
        }

        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn parse_reads_line_contract() {
        let raw = "\
some banner text
pass tests::alpha
fail tests::beta
error tests::gamma
PASS tests::delta
unparseable
";
        let output = TestRunOutput::parse(raw);
        assert!(output.passed.contains("tests::alpha"));
        assert!(output.passed.contains("tests::delta"));
        assert!(output.failed.contains("tests::beta"));
        assert!(output.errored.contains("tests::gamma"));
        assert_eq!(output.total(), 4);
    }

    #[test]
    fn parse_empty_output() {
        let output = TestRunOutput::parse("");
        assert_eq!(output.total(), 0);
    }

    /// Write a shell script harness that prints fixed results.
    fn script_harness(dir: &std::path::Path, body: &str) -> Vec<String> {
        let script = dir.join("harness.sh");
        fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        }
        vec![script.to_string_lossy().to_string()]
    }

    #[tokio::test]
    async fn run_parses_harness_output() {
        let dir = tempdir().unwrap();
        let cmd = script_harness(dir.path(), "echo 'pass t::a'\necho 'fail t::b'");
        let runner = TestRunner::new(cmd, dir.path().to_path_buf(), Duration::from_secs(10));

        let output = runner.run(None).await.unwrap();
        assert!(output.passed.contains("t::a"));
        assert!(output.failed.contains("t::b"));
    }

    #[tokio::test]
    async fn run_fails_when_harness_produces_nothing_and_exits_nonzero() {
        let dir = tempdir().unwrap();
        let cmd = script_harness(dir.path(), "exit 3");
        let runner = TestRunner::new(cmd, dir.path().to_path_buf(), Duration::from_secs(10));

        let err = runner.run(None).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 3"));
    }

    #[tokio::test]
    async fn nonzero_exit_with_results_is_not_an_error() {
        // Most harnesses exit nonzero when tests fail; results still
        // count.
        let dir = tempdir().unwrap();
        let cmd = script_harness(dir.path(), "echo 'fail t::x'\nexit 1");
        let runner = TestRunner::new(cmd, dir.path().to_path_buf(), Duration::from_secs(10));

        let output = runner.run(None).await.unwrap();
        assert!(output.failed.contains("t::x"));
    }

    #[tokio::test]
    async fn capture_baseline_records_t0() {
        let dir = tempdir().unwrap();
        let cmd = script_harness(
            dir.path(),
            "echo 'pass t::a'\necho 'fail t::pre'\necho 'error t::broken'",
        );
        let runner = TestRunner::new(cmd, dir.path().to_path_buf(), Duration::from_secs(10));

        let baseline = runner.capture_baseline().await.unwrap();
        assert!(baseline.passed.contains("t::a"));
        assert!(baseline.failed.contains("t::pre"));
        assert!(baseline.errored.contains("t::broken"));
    }

    #[tokio::test]
    async fn run_attempt_confirms_flaky_with_rerun() {
        // First invocation fails t::flaky; the selection re-run (which
        // receives the test id as an argument) passes it.
        let dir = tempdir().unwrap();
        let cmd = script_harness(
            dir.path(),
            r#"if [ $# -gt 0 ]; then echo "pass t::flaky"; else echo 'pass t::a'; echo 'fail t::flaky'; fi"#,
        );
        let runner = TestRunner::new(cmd, dir.path().to_path_buf(), Duration::from_secs(10));

        let baseline = BaselineReport::from_run(&TestRunOutput::parse("pass t::a\npass t::flaky"));
        let delta = runner.run_attempt(&baseline).await.unwrap();

        assert!(delta.new_failures().is_empty());
        assert_eq!(delta.flaky(), vec!["t::flaky"]);
        assert!(delta.is_clean());
    }

    #[tokio::test]
    async fn run_attempt_keeps_confirmed_failures() {
        let dir = tempdir().unwrap();
        let cmd = script_harness(dir.path(), "echo 'fail t::broken'");
        let runner = TestRunner::new(cmd, dir.path().to_path_buf(), Duration::from_secs(10));

        let baseline = BaselineReport::from_run(&TestRunOutput::parse("pass t::broken"));
        let delta = runner.run_attempt(&baseline).await.unwrap();
        assert_eq!(delta.new_failures(), vec!["t::broken"]);
    }
}
