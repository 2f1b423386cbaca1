//! Run orchestrator: walks the phase DAG of a plan, one phase running
//! at a time, under run-level token and wallclock budgets.
//!
//! A run owns its working directory, its persistent state rows, and
//! the advisory lock that serializes workspace mutations for that
//! directory. Cross-run parallelism is safe; intra-run execution is
//! deliberately serial.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::ApprovalBroker;
use crate::baseline::TestRunner;
use crate::config::Config;
use crate::learning::LearningStore;
use crate::phase::{BuildPlan, PhaseRecord, PhaseState, RunRecord, RunState};
use crate::store::Store;
use crate::workspace::{PathPolicy, SavePointEngine, WorkspaceGateway};

use super::phase::{PhaseOrchestrator, PhaseRunResult, PhaseServices};

pub struct RunOrchestrator {
    config: Config,
    store: Arc<Store>,
    broker: Arc<ApprovalBroker>,
    learning: LearningStore,
    phase_orchestrator: PhaseOrchestrator,
    abort: Arc<AtomicBool>,
}

impl RunOrchestrator {
    pub fn new(services: PhaseServices) -> Self {
        let config = services.config.clone();
        let store = Arc::clone(&services.store);
        let broker = Arc::clone(&services.broker);
        let learning = LearningStore::new(
            Arc::clone(&services.store),
            config.settings.hint_promotion_min_occurrences,
        );
        Self {
            config,
            store,
            broker,
            learning,
            phase_orchestrator: PhaseOrchestrator::new(services),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle used to signal best-effort cancellation from a signal
    /// handler or another task.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Validate and persist a plan; returns the new run id. The run
    /// starts in `queued` and is driven by [`RunOrchestrator::execute`].
    pub fn submit(&self, plan: BuildPlan) -> Result<String> {
        plan.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let run = RunRecord::new(&run_id, plan);
        self.store.save_run(&run)?;

        for spec in &run.plan.phases {
            let record = PhaseRecord::new(&run_id, spec.clone());
            self.store.save_phase(&record)?;
        }
        info!(run_id = %run_id, phases = run.plan.phases.len(), "plan submitted");
        Ok(run_id)
    }

    fn budget_exceeded(&self, run: &RunRecord, started: Instant) -> Option<String> {
        let settings = &self.config.settings;
        if run.counters.tokens_consumed >= settings.max_tokens_per_run {
            return Some(format!(
                "token budget exhausted ({} >= {})",
                run.counters.tokens_consumed, settings.max_tokens_per_run
            ));
        }
        if started.elapsed().as_secs() >= settings.max_wallclock_seconds {
            return Some("wallclock budget exhausted".into());
        }
        None
    }

    fn aborted_externally(&self, run_id: &str) -> Result<bool> {
        if self.abort.load(Ordering::SeqCst) {
            return Ok(true);
        }
        // The CLI abort path writes the run state directly.
        Ok(self
            .store
            .get_run(run_id)?
            .map(|r| r.state == RunState::Aborted)
            .unwrap_or(false))
    }

    /// Drive a submitted run to a terminal (or paused) state.
    pub async fn execute(&self, run_id: &str) -> Result<RunState> {
        let Some(mut run) = self.store.get_run(run_id)? else {
            bail!("Unknown run: {}", run_id);
        };
        if run.state.is_terminal() {
            return Ok(run.state);
        }

        // One process per working directory.
        let lock_file = std::fs::File::create(self.config.lock_path())
            .context("Failed to create run lock file")?;
        lock_file
            .try_lock_exclusive()
            .context("Another autopack process holds this working directory")?;

        run.state = RunState::Running;
        self.store.save_run(&run)?;
        let started = Instant::now();

        let save_points = SavePointEngine::open_or_init(&self.config.project_dir)?;
        let test_runner = TestRunner::new(
            self.config.agents.harness_cmd.clone(),
            self.config.project_dir.clone(),
            std::time::Duration::from_secs(self.config.settings.test_timeout_seconds),
        );

        // Baseline (T0): captured once at run start, reloaded on
        // restart.
        let mut baseline = match self.store.get_baseline(run_id)? {
            Some(baseline) => baseline,
            None => {
                info!(run_id = %run_id, "capturing test baseline (T0)");
                let baseline = test_runner.capture_baseline().await?;
                if baseline.has_collection_errors() {
                    warn!(
                        errors = baseline.errored.len(),
                        "baseline contains collection errors; annotated, not blocking"
                    );
                }
                self.store.save_baseline(run_id, &baseline)?;
                baseline
            }
        };

        let order = run.plan.topological_order();
        let mut outcome_state = RunState::Complete;

        for phase_id in &order {
            if self.aborted_externally(run_id)? {
                return self.finish_aborted(&mut run).await;
            }
            if let Some(reason) = self.budget_exceeded(&run, started) {
                warn!(run_id = %run_id, reason = %reason, "run paused at budget limit");
                run.state = RunState::Paused;
                self.store.save_run(&run)?;
                return Ok(RunState::Paused);
            }

            let Some(mut record) = self.store.get_phase(run_id, phase_id)? else {
                bail!("Phase {} missing from store", phase_id);
            };
            if record.state == PhaseState::Complete {
                continue;
            }

            // A phase enters running only when all dependencies are
            // complete. A blocked or failed dependency blocks it too.
            let mut blocked_by_dependency = None;
            for dep in &record.spec.dependencies {
                let dep_state = self
                    .store
                    .get_phase(run_id, dep)?
                    .map(|p| p.state)
                    .unwrap_or(PhaseState::Queued);
                if dep_state != PhaseState::Complete {
                    blocked_by_dependency = Some(dep.clone());
                    break;
                }
            }
            if let Some(dep) = blocked_by_dependency {
                record.state = PhaseState::Blocked;
                self.store.save_phase(&record)?;
                self.store.append_audit(
                    run_id,
                    phase_id,
                    "dependency-blocked",
                    &format!("dependency {} did not complete", dep),
                )?;
                outcome_state = RunState::Failed;
                if run.failure.is_none() {
                    run.failure = Some(format!(
                        "phase {} blocked: dependency {} did not complete",
                        phase_id, dep
                    ));
                }
                continue;
            }

            let policy = PathPolicy::new(
                self.config.global_protected_paths(),
                record.spec.protected_paths.clone(),
                record.spec.scope_paths.clone(),
            );
            let gateway = WorkspaceGateway::new(self.config.project_dir.clone(), policy)?;

            let result = self
                .phase_orchestrator
                .run_phase(
                    &mut record,
                    &mut run.counters,
                    &mut baseline,
                    &gateway,
                    &save_points,
                    &test_runner,
                    started,
                    &self.abort,
                )
                .await?;

            // Counters are persisted after every phase so monotonicity
            // survives restarts.
            self.store.save_run(&run)?;

            match result {
                PhaseRunResult::Complete => {}
                PhaseRunResult::Blocked { detail } => {
                    warn!(phase = %phase_id, detail = %detail, "phase blocked, continuing run");
                    outcome_state = RunState::Failed;
                    if run.failure.is_none() {
                        run.failure = Some(format!("phase {} blocked: {}", phase_id, detail));
                    }
                }
                PhaseRunResult::Failed { reason } => {
                    run.state = RunState::Failed;
                    run.failure = Some(format!("phase {} failed: {}", phase_id, reason));
                    run.ended_at = Some(chrono::Utc::now());
                    self.store.save_run(&run)?;
                    self.learning.discard_run(run_id)?;
                    self.broker.cancel_run(run_id, "enclosing-phase-terminated")?;
                    return Ok(RunState::Failed);
                }
            }
        }

        if self.aborted_externally(run_id)? {
            return self.finish_aborted(&mut run).await;
        }

        run.state = outcome_state;
        run.ended_at = Some(chrono::Utc::now());
        self.store.save_run(&run)?;
        self.learning.discard_run(run_id)?;
        info!(run_id = %run_id, state = run.state.as_str(), "run finished");
        Ok(run.state)
    }

    /// Abort bookkeeping: cancel pending approvals, drop run hints,
    /// leave the baseline watermark untouched.
    async fn finish_aborted(&self, run: &mut RunRecord) -> Result<RunState> {
        run.state = RunState::Aborted;
        run.ended_at = Some(chrono::Utc::now());
        self.store.save_run(run)?;
        self.broker
            .cancel_run(&run.run_id, "enclosing-phase-terminated")?;
        self.learning.discard_run(&run.run_id)?;
        info!(run_id = %run.run_id, "run aborted");
        Ok(RunState::Aborted)
    }
}
