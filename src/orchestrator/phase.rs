//! Per-phase retry/escalation state machine.
//!
//! One attempt is: load rules and hints, pick a model tier, invoke the
//! Builder, plan and govern the patch, apply under a save point, run
//! the Auditor, run the tests, and ask the finalizer. A failed attempt
//! rolls the workspace back, records a normalized error, and then the
//! retry decision runs: re-plan trigger first, Doctor second,
//! escalation third, exhaustion last.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::agents::{
    BuilderAgent, BuilderRequest, DoctorAction, ModelTier, ProviderRegistry, ReplanAgent,
    ReplanReply, AuditorAgent,
};
use crate::approval::{ApprovalBroker, ApprovalKind, ApprovalRequest};
use crate::baseline::{BaselineReport, TestRunner};
use crate::config::Config;
use crate::doctor::{build_evidence, Doctor};
use crate::errors::{FailureCategory, PatchError};
use crate::finalizer::{self, deliverable_hint, BlockReason, PhaseOutcome, QualityGate};
use crate::governance::{self, ApprovalReason, Decision, GovernanceContext};
use crate::learning::LearningStore;
use crate::patch::{ApplyReport, PatchEngine};
use crate::phase::{ErrorRecord, PhaseRecord, PhaseState, RunCounters};
use crate::replan::{self, normalize_message, ReplanCause, ReplanTrigger};
use crate::store::Store;
use crate::workspace::{ExceptionToken, SavePoint, SavePointEngine, WorkspaceGateway};

/// The phase-level result handed back to the run orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseRunResult {
    Complete,
    /// The phase was skipped or blocked; the run may continue with
    /// independent phases.
    Blocked { detail: String },
    /// Unrecoverable for this run.
    Failed { reason: String },
}

/// Everything a phase execution needs.
pub struct PhaseServices {
    pub config: Config,
    pub store: Arc<Store>,
    pub builder: Arc<dyn BuilderAgent>,
    pub auditor: Arc<dyn AuditorAgent>,
    pub doctor: Doctor,
    pub replanner: Arc<dyn ReplanAgent>,
    pub broker: Arc<ApprovalBroker>,
    pub learning: LearningStore,
    pub providers: Arc<ProviderRegistry>,
}

enum AttemptOutcome {
    Complete {
        fixed: BTreeSet<String>,
    },
    Failure {
        category: FailureCategory,
        message: String,
        save_point: Option<SavePoint>,
        report: Option<ApplyReport>,
        /// True when the retry loop must not continue
        terminal: bool,
    },
}

pub struct PhaseOrchestrator {
    services: PhaseServices,
    engine: PatchEngine,
    trigger: ReplanTrigger,
}

impl PhaseOrchestrator {
    pub fn new(services: PhaseServices) -> Self {
        let engine = PatchEngine::new(services.config.settings.structural_similarity_min);
        let trigger = ReplanTrigger::from_settings(&services.config.settings);
        Self {
            services,
            engine,
            trigger,
        }
    }

    fn settings(&self) -> &crate::config::Settings {
        &self.services.config.settings
    }

    fn audit(&self, record: &PhaseRecord, kind: &str, detail: &str) {
        if let Err(e) = self
            .services
            .store
            .append_audit(&record.run_id, &record.spec.id, kind, detail)
        {
            warn!(error = %e, "failed to append audit entry");
        }
    }

    fn persist(&self, record: &PhaseRecord) -> Result<()> {
        self.services.store.save_phase(record)
    }

    fn health_ratio(&self, counters: &RunCounters, run_started: Instant) -> f64 {
        let settings = self.settings();
        let token_ratio = counters.tokens_consumed as f64 / settings.max_tokens_per_run as f64;
        let clock_ratio =
            run_started.elapsed().as_secs_f64() / settings.max_wallclock_seconds as f64;
        token_ratio.max(clock_ratio)
    }

    /// Drive one phase to a terminal result.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_phase(
        &self,
        record: &mut PhaseRecord,
        counters: &mut RunCounters,
        baseline: &mut BaselineReport,
        gateway: &WorkspaceGateway,
        save_points: &SavePointEngine,
        test_runner: &TestRunner,
        run_started: Instant,
        abort: &AtomicBool,
    ) -> Result<PhaseRunResult> {
        record.state = PhaseState::Running;
        self.persist(record)?;
        info!(phase = %record.spec.id, goal = %record.spec.goal, "phase started");

        let mut pending_hint: Option<String> = None;
        let mut attempts_at_level: u32 = 0;
        let mut rejection_counts: HashMap<String, u32> = HashMap::new();

        loop {
            if abort.load(Ordering::SeqCst) {
                self.services.broker.cancel_phase(
                    &record.run_id,
                    &record.spec.id,
                    "enclosing-phase-terminated",
                )?;
                record.state = PhaseState::Failed;
                self.persist(record)?;
                return Ok(PhaseRunResult::Failed {
                    reason: "run aborted".into(),
                });
            }

            let outcome = self
                .attempt(
                    record,
                    counters,
                    baseline,
                    gateway,
                    save_points,
                    test_runner,
                    pending_hint.as_deref(),
                    &mut rejection_counts,
                )
                .await?;
            counters.attempts += 1;

            match outcome {
                AttemptOutcome::Complete { fixed } => {
                    // The baseline watermark moves only on finalized
                    // COMPLETE.
                    if !fixed.is_empty() {
                        baseline.absorb_fixed(&fixed);
                        self.services.store.save_baseline(&record.run_id, baseline)?;
                        self.audit(
                            record,
                            "baseline-watermark",
                            &format!("absorbed fixed tests: {:?}", fixed),
                        );
                    }
                    self.services
                        .learning
                        .mark_hints_successful(&record.run_id, &record.spec.id)?;
                    record.state = PhaseState::Complete;
                    self.persist(record)?;
                    info!(phase = %record.spec.id, attempts = record.retry_attempt + 1, "phase complete");
                    return Ok(PhaseRunResult::Complete);
                }
                AttemptOutcome::Failure {
                    category,
                    message,
                    save_point,
                    report,
                    terminal,
                } => {
                    if let Some(sp) = &save_point {
                        save_points
                            .rollback_to(sp)
                            .context("rollback after failed attempt")?;
                        self.audit(record, "rollback", &sp.id);
                    }

                    record.retry_attempt += 1;
                    record.record_failure(ErrorRecord::new(category, normalize_message(&message)));
                    self.persist(record)?;
                    debug!(
                        phase = %record.spec.id,
                        attempt = record.retry_attempt,
                        category = %category,
                        "attempt failed"
                    );

                    if terminal {
                        self.terminate_failed(record, &message)?;
                        return Ok(PhaseRunResult::Failed { reason: message });
                    }

                    // Retry decision. Re-plan trigger first: a reset
                    // retry counter gives the revised goal fresh cheap
                    // attempts.
                    if let Some(cause) = self.trigger.detect(record) {
                        if self.replan_budget_ok(record, counters)
                            && self.try_replan(record, counters, cause).await?
                        {
                            pending_hint = None;
                            attempts_at_level = 0;
                            continue;
                        }
                    }

                    // Doctor second, under its eligibility rules.
                    let health = self.health_ratio(counters, run_started);
                    let patch_summary = report.as_ref().map(|r| {
                        format!(
                            "{} file(s) touched, +{} -{} lines",
                            r.total_files(),
                            r.lines_added,
                            r.lines_deleted
                        )
                    });
                    let rule_texts: Vec<String> = self
                        .services
                        .learning
                        .rules_for_phase(&record.spec.scope_paths, None)?
                        .into_iter()
                        .map(|r| r.body)
                        .collect();
                    let evidence = build_evidence(record, rule_texts, patch_summary, None);

                    match self
                        .services
                        .doctor
                        .consult(record, counters, health, evidence)
                        .await
                    {
                        Ok(Some(verdict)) => {
                            counters.doctor_invocations += 1;
                            counters.doctor_strong_invocations += verdict.strong_invocations;
                            record.doctor_invocations += 1;
                            counters.tokens_consumed +=
                                verdict.response.tokens_in + verdict.response.tokens_out;
                            self.audit(
                                record,
                                "doctor",
                                &format!(
                                    "tier={} confidence={:.2} action={:?}",
                                    verdict.tier_used.as_str(),
                                    verdict.response.confidence,
                                    verdict.response.action
                                ),
                            );
                            self.persist(record)?;

                            match verdict.response.action {
                                DoctorAction::RetryWithFix { hint } => {
                                    self.services.learning.record_hint(
                                        &record.run_id,
                                        &record.spec.id,
                                        &hint,
                                    )?;
                                    pending_hint = Some(hint);
                                }
                                DoctorAction::Replan => {
                                    if self.replan_budget_ok(record, counters)
                                        && self
                                            .try_replan(
                                                record,
                                                counters,
                                                ReplanCause::DoctorRequested,
                                            )
                                            .await?
                                    {
                                        pending_hint = None;
                                        attempts_at_level = 0;
                                        continue;
                                    }
                                }
                                DoctorAction::SkipPhase { reason } => {
                                    record.state = PhaseState::Blocked;
                                    self.persist(record)?;
                                    self.services.broker.cancel_phase(
                                        &record.run_id,
                                        &record.spec.id,
                                        "enclosing-phase-terminated",
                                    )?;
                                    return Ok(PhaseRunResult::Blocked { detail: reason });
                                }
                                DoctorAction::FatalError { reason } => {
                                    self.terminate_failed(record, &reason)?;
                                    return Ok(PhaseRunResult::Failed { reason });
                                }
                                DoctorAction::RollbackProvider { provider_id } => {
                                    self.services.providers.disable(&provider_id);
                                    self.audit(
                                        record,
                                        "provider-rollback",
                                        &format!("disabled provider {}", provider_id),
                                    );
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            // A failing Doctor never fails the phase.
                            warn!(error = %e, "doctor invocation failed");
                        }
                    }

                    // Escalation: bump the tier after exhausting the
                    // current tier's attempt budget.
                    attempts_at_level += 1;
                    if attempts_at_level >= self.settings().attempts_per_tier {
                        record.escalation_level += 1;
                        attempts_at_level = 0;
                        self.audit(
                            record,
                            "escalation",
                            &format!("escalation_level={}", record.escalation_level),
                        );
                    }

                    if record.retry_attempt >= self.settings().max_attempts_per_phase {
                        let reason = format!(
                            "exhausted-attempts: {} attempts, last failure {}",
                            record.retry_attempt, category
                        );
                        self.terminate_failed(record, &reason)?;
                        return Ok(PhaseRunResult::Failed { reason });
                    }

                    // Bounded backoff for infrastructure-class noise.
                    if category.is_infrastructure() {
                        let backoff = std::time::Duration::from_millis(
                            100u64.saturating_mul(1 << record.retry_attempt.min(3)),
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }

    fn terminate_failed(&self, record: &mut PhaseRecord, reason: &str) -> Result<()> {
        record.state = PhaseState::Failed;
        self.persist(record)?;
        self.services.broker.cancel_phase(
            &record.run_id,
            &record.spec.id,
            "enclosing-phase-terminated",
        )?;
        self.audit(record, "phase-failed", reason);
        Ok(())
    }

    fn replan_budget_ok(&self, record: &PhaseRecord, counters: &RunCounters) -> bool {
        record.replans < self.settings().max_replans_per_phase
            && counters.replans < self.settings().max_replans_per_run
    }

    /// Call the re-plan agent and apply the revision if it passes the
    /// goal-anchoring check. Returns whether a revision was accepted.
    async fn try_replan(
        &self,
        record: &mut PhaseRecord,
        counters: &mut RunCounters,
        cause: ReplanCause,
    ) -> Result<bool> {
        self.audit(record, "replan-triggered", &format!("{:?}", cause));
        let reply = match self
            .services
            .replanner
            .revise(&record.spec, &record.original_intent, &record.error_history)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "re-plan agent failed");
                return Ok(false);
            }
        };

        match reply {
            ReplanReply::Revised { phase } => {
                if let Err(rejection) = replan::accept_revision(record, &phase) {
                    self.audit(record, "replan-rejected", &rejection);
                    return Ok(false);
                }
                replan::apply_revision(record, phase);
                record.retry_attempt = 0;
                if self.settings().replan_resets_escalation {
                    record.escalation_level = 0;
                }
                counters.replans += 1;
                self.persist(record)?;
                self.audit(record, "replan-accepted", &record.spec.goal);
                info!(phase = %record.spec.id, "re-plan accepted, retry counter reset");
                Ok(true)
            }
            ReplanReply::Refused { reason } => {
                self.audit(record, "replan-refused", &reason);
                Ok(false)
            }
        }
    }

    fn kind_for(reason: ApprovalReason) -> ApprovalKind {
        match reason {
            ApprovalReason::LargeDeletion => ApprovalKind::DeletionThreshold,
            ApprovalReason::ScopeException => ApprovalKind::GovernanceException,
            ApprovalReason::StructuralDrift
            | ApprovalReason::SymbolDeletion
            | ApprovalReason::RiskyPatch => ApprovalKind::RiskyPatch,
        }
    }

    /// Run the governance decider over a report, escalating each
    /// require-approval through the broker until the decision settles.
    /// Approved reasons accumulate in `granted` (respected silently on
    /// re-evaluation) and approved paths mint exception tokens.
    /// Returns the failure outcome when the attempt cannot proceed.
    #[allow(clippy::too_many_arguments)]
    async fn governance_gate(
        &self,
        record: &mut PhaseRecord,
        report: &ApplyReport,
        tokens: &mut Vec<ExceptionToken>,
        granted: &mut Vec<ApprovalReason>,
        auditor_risk_flags: &[String],
        rejection_counts: &mut HashMap<String, u32>,
        failure_save_point: Option<&SavePoint>,
    ) -> Result<Option<AttemptOutcome>> {
        loop {
            let ctx = GovernanceContext {
                tokens: tokens.as_slice(),
                granted: granted.as_slice(),
                auditor_risk_flags,
                deletion_approval_threshold_lines: self
                    .settings()
                    .deletion_approval_threshold_lines,
                deletion_deny_threshold_lines: self.settings().deletion_deny_threshold_lines,
            };
            let decision = governance::decide(report, &ctx);
            self.audit(
                record,
                "governance-decision",
                &serde_json::to_string(&decision).unwrap_or_default(),
            );

            match decision {
                Decision::Allow => return Ok(None),
                Decision::Deny { reason } => {
                    let key = format!("deny:{}", reason);
                    let count = rejection_counts.entry(key).or_insert(0);
                    *count += 1;
                    let terminal = *count > self.settings().max_governance_rerequests;
                    return Ok(Some(AttemptOutcome::Failure {
                        category: FailureCategory::GovernanceDenied,
                        message: reason,
                        save_point: failure_save_point.cloned(),
                        report: Some(report.clone()),
                        terminal,
                    }));
                }
                Decision::RequireApproval {
                    reason,
                    severity: _,
                    detail,
                    paths,
                } => {
                    let key = format!("approval:{}:{}", reason.as_str(), detail);
                    if rejection_counts.get(&key).copied().unwrap_or(0)
                        > self.settings().max_governance_rerequests
                    {
                        // Re-request suppression: the same gate was
                        // already rejected too often.
                        return Ok(Some(AttemptOutcome::Failure {
                            category: FailureCategory::GovernanceDenied,
                            message: format!("approval re-request suppressed: {}", detail),
                            save_point: failure_save_point.cloned(),
                            report: Some(report.clone()),
                            terminal: true,
                        }));
                    }

                    let request = ApprovalRequest::new(
                        &record.run_id,
                        &record.spec.id,
                        Self::kind_for(reason),
                        &detail,
                        serde_json::to_string(report).unwrap_or_default(),
                        chrono::Duration::seconds(
                            self.settings().approval_timeout_seconds as i64,
                        ),
                        self.settings().approval_default_on_timeout,
                    );
                    self.audit(record, "approval-requested", &request.request_id);

                    // Suspend the attempt until the request resolves.
                    record.state = PhaseState::AwaitingApproval;
                    self.persist(record)?;
                    let outcome = self.services.broker.request(request).await?;
                    record.state = PhaseState::Running;
                    self.persist(record)?;

                    if outcome.approved {
                        for path in &paths {
                            let token = ExceptionToken::new(
                                path.to_string_lossy().to_string(),
                                &record.spec.id,
                            );
                            self.audit(
                                record,
                                "exception-token",
                                &format!("{} for {}", token.token_id, path.display()),
                            );
                            tokens.push(token);
                        }
                        granted.push(reason);
                        continue;
                    }

                    let count = rejection_counts.entry(key).or_insert(0);
                    *count += 1;
                    return Ok(Some(AttemptOutcome::Failure {
                        category: FailureCategory::GovernanceDenied,
                        message: format!("approval {} ({})", outcome.status.as_str(), detail),
                        save_point: failure_save_point.cloned(),
                        report: Some(report.clone()),
                        terminal: false,
                    }));
                }
            }
        }
    }

    /// One attempt: Builder -> Patch Engine -> Governance -> apply ->
    /// Auditor -> Test Runner -> Finalizer.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        record: &mut PhaseRecord,
        counters: &mut RunCounters,
        baseline: &BaselineReport,
        gateway: &WorkspaceGateway,
        save_points: &SavePointEngine,
        test_runner: &TestRunner,
        pending_hint: Option<&str>,
        rejection_counts: &mut HashMap<String, u32>,
    ) -> Result<AttemptOutcome> {
        let spec = record.spec.clone();

        // 1. Learned rules and hints.
        let rules: Vec<String> = self
            .services
            .learning
            .rules_for_phase(&spec.scope_paths, None)?
            .into_iter()
            .map(|r| r.body)
            .collect();
        let mut hints: Vec<String> = self
            .services
            .learning
            .hints_for_phase(&record.run_id, &spec.id)?
            .into_iter()
            .map(|h| h.body)
            .collect();
        if let Some(hint) = pending_hint {
            if !hints.iter().any(|h| h == hint) {
                hints.push(hint.to_string());
            }
        }

        // 2. Model tier from (complexity, escalation level).
        let tier = ModelTier::select(spec.complexity, record.escalation_level);

        // 3. Context under the token budget.
        let assembler =
            super::context::ContextAssembler::new(self.settings().context_token_budget_per_attempt);
        let context_files = match assembler.assemble(gateway.root(), &spec) {
            Ok(files) => files,
            Err(e) => {
                return Ok(AttemptOutcome::Failure {
                    category: FailureCategory::Infrastructure,
                    message: e.to_string(),
                    save_point: None,
                    report: None,
                    terminal: false,
                })
            }
        };

        let prefer_structured_edits =
            context_files.len() >= self.settings().large_scope_structured_edit_threshold_files;
        let request = BuilderRequest {
            goal: spec.goal.clone(),
            acceptance_criteria: spec.acceptance_criteria.clone(),
            scope_paths: spec.scope_paths.clone(),
            deliverables: spec.deliverables.clone(),
            context_files,
            rules,
            hints,
            tier,
            prefer_structured_edits,
        };

        // 4. Builder.
        let bundle = match self.services.builder.build(&request).await {
            Ok(bundle) => bundle,
            Err(e) => {
                return Ok(AttemptOutcome::Failure {
                    category: e.category(),
                    message: e.to_string(),
                    save_point: None,
                    report: None,
                    terminal: false,
                })
            }
        };
        counters.tokens_consumed += bundle.total_tokens();

        // 5. Parse and plan.
        let patch = match bundle.parse() {
            Ok(patch) => patch,
            Err(e) => {
                // C2's self-correction hint for the next attempt.
                self.services.learning.record_hint(
                    &record.run_id,
                    &spec.id,
                    &format!("Previous patch was rejected by the parser: {}", e),
                )?;
                return Ok(AttemptOutcome::Failure {
                    category: e.category(),
                    message: e.to_string(),
                    save_point: None,
                    report: None,
                    terminal: false,
                });
            }
        };

        let plan = match self.engine.plan(&patch, gateway) {
            Ok(plan) => plan,
            Err(e) => {
                if matches!(e, PatchError::Parse(_)) {
                    self.services.learning.record_hint(
                        &record.run_id,
                        &spec.id,
                        &format!("Previous patch was rejected by the parser: {}", e),
                    )?;
                }
                return Ok(AttemptOutcome::Failure {
                    category: e.category(),
                    message: e.to_string(),
                    save_point: None,
                    report: None,
                    terminal: false,
                });
            }
        };

        // Pre-apply governance over the prospective report. Approved
        // reasons and minted tokens carry into the post-audit gate.
        let mut tokens: Vec<ExceptionToken> = Vec::new();
        let mut granted: Vec<ApprovalReason> = Vec::new();
        if let Some(failure) = self
            .governance_gate(
                record,
                &plan.report,
                &mut tokens,
                &mut granted,
                &[],
                rejection_counts,
                None,
            )
            .await?
        {
            return Ok(failure);
        }

        // 6. Apply under a save point.
        let (save_point, report) = match self.engine.apply(
            &plan,
            gateway,
            save_points,
            &spec.id,
            record.retry_attempt,
            &tokens,
        ) {
            Ok(applied) => applied,
            Err(PatchError::Io { path, source }) => {
                // Rollback failure inside apply is unrecoverable.
                return Ok(AttemptOutcome::Failure {
                    category: FailureCategory::Infrastructure,
                    message: format!("workspace I/O failure at {}: {}", path.display(), source),
                    save_point: None,
                    report: None,
                    terminal: true,
                });
            }
            Err(e) => {
                return Ok(AttemptOutcome::Failure {
                    category: e.category(),
                    message: e.to_string(),
                    save_point: None,
                    report: None,
                    terminal: false,
                })
            }
        };
        self.services
            .store
            .record_save_point(&record.run_id, &save_point)?;
        self.audit(record, "save-point", &save_point.id);

        // 7. Auditor; its report feeds governance and the finalizer.
        let quality = match self.services.auditor.audit(&report, &spec).await {
            Ok(quality) => quality,
            Err(e) => {
                return Ok(AttemptOutcome::Failure {
                    category: e.category(),
                    message: e.to_string(),
                    save_point: Some(save_point),
                    report: Some(report),
                    terminal: false,
                })
            }
        };
        counters.tokens_consumed += quality.tokens_in + quality.tokens_out;

        // Risk flags re-enter governance: a flagged patch needs an
        // approval before the attempt may continue, and a rejection
        // rolls the applied patch back.
        if !quality.risk_flags.is_empty() {
            self.audit(record, "auditor", &quality.risk_flags.join(", "));
            if let Some(failure) = self
                .governance_gate(
                    record,
                    &report,
                    &mut tokens,
                    &mut granted,
                    &quality.risk_flags,
                    rejection_counts,
                    Some(&save_point),
                )
                .await?
            {
                return Ok(failure);
            }
        }

        // 8. Tests.
        let delta = match test_runner.run_attempt(baseline).await {
            Ok(delta) => delta,
            Err(e) => {
                return Ok(AttemptOutcome::Failure {
                    category: FailureCategory::Infrastructure,
                    message: e.to_string(),
                    save_point: Some(save_point),
                    report: Some(report),
                    terminal: false,
                })
            }
        };

        // 9. Finalizer. Approvals were resolved inline above, so only
        // the Auditor half of the quality gate can block here.
        let quality_gate = QualityGate::from_quality_report(&quality);
        let outcome = finalizer::finalize(&spec, gateway, &delta, &quality_gate);
        match outcome {
            PhaseOutcome::Complete => Ok(AttemptOutcome::Complete {
                fixed: delta.fixed(),
            }),
            PhaseOutcome::Blocked { reason } => {
                if let BlockReason::MissingDeliverables { paths } = &reason {
                    let hint = deliverable_hint(paths, &report);
                    self.services
                        .learning
                        .record_hint(&record.run_id, &spec.id, &hint)?;
                }
                Ok(AttemptOutcome::Failure {
                    category: reason.category(),
                    message: reason.describe(),
                    save_point: Some(save_point),
                    report: Some(report),
                    terminal: false,
                })
            }
            PhaseOutcome::Failed { reason } => Ok(AttemptOutcome::Failure {
                category: FailureCategory::Unknown,
                message: reason,
                save_point: Some(save_point),
                report: Some(report),
                terminal: true,
            }),
        }
    }
}
