//! Doctor: the failure-triage loop around the external diagnostic
//! agent.
//!
//! The Doctor is consulted only under strict eligibility rules: enough
//! same-category failures (or an infrastructure failure, which skips
//! the wait), unexhausted per-phase and per-run budgets, and a run
//! health budget not near its limit. Tactical failure categories are
//! excluded entirely until attempts are exhausted; they self-correct
//! through recorded hints instead, and never consume Doctor budget.
//!
//! Diagnosis starts on the cheap model and escalates to the strong
//! model for high-risk categories, late-stage retries, or low-
//! confidence cheap verdicts. Strong invocations have their own
//! per-run budget.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agents::{DoctorAgent, DoctorEvidence, DoctorResponse, ModelTier};
use crate::config::Settings;
use crate::errors::{FailureCategory, InfraError};
use crate::phase::{PhaseRecord, RunCounters};
use std::sync::Arc;

/// Why the Doctor was not consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ineligible {
    /// Tactical categories rely on hint-driven self-correction
    TacticalExclusion,
    /// Not enough same-category failures yet
    TooFewFailures,
    PhaseBudgetExhausted,
    RunBudgetExhausted,
    HealthBudgetNearLimit,
    NoFailureRecorded,
}

/// The result of an actual Doctor invocation.
#[derive(Debug, Clone)]
pub struct DoctorVerdict {
    pub response: DoctorResponse,
    pub tier_used: ModelTier,
    /// True when a low-confidence cheap verdict was re-run on the
    /// strong model
    pub escalated: bool,
    /// Strong-model invocations consumed (0, 1)
    pub strong_invocations: u32,
}

pub struct Doctor {
    agent: Arc<dyn DoctorAgent>,
    settings: Settings,
}

impl Doctor {
    pub fn new(agent: Arc<dyn DoctorAgent>, settings: Settings) -> Self {
        Self { agent, settings }
    }

    /// The eligibility gate. `health_ratio_consumed` is the larger of
    /// the run's token and wallclock consumption ratios.
    pub fn check_eligibility(
        &self,
        record: &PhaseRecord,
        counters: &RunCounters,
        health_ratio_consumed: f64,
    ) -> Result<(), Ineligible> {
        let Some(last) = record.error_history.last() else {
            return Err(Ineligible::NoFailureRecorded);
        };
        let category = last.category;

        // Tactical failures never reach the Doctor before attempts are
        // exhausted; hint-driven self-correction owns them.
        if category.is_tactical() && record.retry_attempt < self.settings.max_attempts_per_phase {
            return Err(Ineligible::TacticalExclusion);
        }

        // Infrastructure failures permit immediate invocation; anything
        // else waits for repeated same-category failures.
        if !category.is_infrastructure() {
            let same_category = record.trailing_same_category().len() as u32;
            if same_category < self.settings.min_attempts_before_doctor {
                return Err(Ineligible::TooFewFailures);
            }
        }

        if record.doctor_invocations >= self.settings.doctor_max_per_phase {
            return Err(Ineligible::PhaseBudgetExhausted);
        }
        if counters.doctor_invocations >= self.settings.doctor_max_per_run {
            return Err(Ineligible::RunBudgetExhausted);
        }
        if health_ratio_consumed >= self.settings.health_budget_near_limit_ratio {
            return Err(Ineligible::HealthBudgetNearLimit);
        }

        Ok(())
    }

    /// Initial tier: strong for high-risk categories or late-stage
    /// Builder retries, budget permitting.
    fn initial_tier(
        &self,
        category: FailureCategory,
        retry_attempt: u32,
        counters: &RunCounters,
    ) -> ModelTier {
        let wants_strong = category.is_high_risk()
            || retry_attempt >= self.settings.max_builder_attempts_before_complex;
        if wants_strong && counters.doctor_strong_invocations < self.settings.doctor_strong_max_per_run
        {
            ModelTier::Strong
        } else {
            ModelTier::Cheap
        }
    }

    /// Consult the Doctor if eligible. Returns `Ok(None)` with the
    /// ineligibility reason swallowed into the audit trail by the
    /// caller; use [`Doctor::check_eligibility`] directly when the
    /// reason matters.
    pub async fn consult(
        &self,
        record: &PhaseRecord,
        counters: &RunCounters,
        health_ratio_consumed: f64,
        evidence: DoctorEvidence,
    ) -> Result<Option<DoctorVerdict>, InfraError> {
        if self
            .check_eligibility(record, counters, health_ratio_consumed)
            .is_err()
        {
            return Ok(None);
        }

        let category = evidence.failure_category;
        let tier = self.initial_tier(category, record.retry_attempt, counters);
        debug!(
            phase = %record.spec.id,
            tier = tier.as_str(),
            category = %category,
            "invoking doctor"
        );

        let response = self.agent.diagnose(&evidence, tier).await?;
        let mut strong_invocations = u32::from(tier.is_strong());

        // A hesitant cheap verdict is retried once on the strong
        // model, budget permitting.
        if !tier.is_strong()
            && response.confidence < self.settings.doctor_confidence_threshold
            && counters.doctor_strong_invocations < self.settings.doctor_strong_max_per_run
        {
            debug!(
                confidence = response.confidence,
                "cheap doctor verdict below confidence threshold, escalating"
            );
            let strong_response = self.agent.diagnose(&evidence, ModelTier::Strong).await?;
            strong_invocations += 1;
            return Ok(Some(DoctorVerdict {
                response: strong_response,
                tier_used: ModelTier::Strong,
                escalated: true,
                strong_invocations,
            }));
        }

        Ok(Some(DoctorVerdict {
            response,
            tier_used: tier,
            escalated: false,
            strong_invocations,
        }))
    }
}

/// Assemble the evidence bundle for a Doctor invocation.
pub fn build_evidence(
    record: &PhaseRecord,
    learned_rules: Vec<String>,
    last_patch_summary: Option<String>,
    last_delta_summary: Option<String>,
) -> DoctorEvidence {
    let recent_errors = record
        .error_history
        .iter()
        .rev()
        .take(5)
        .rev()
        .cloned()
        .collect();
    DoctorEvidence {
        phase_id: record.spec.id.clone(),
        goal: record.spec.goal.clone(),
        failure_category: record
            .last_failure
            .as_ref()
            .map(|e| e.category)
            .unwrap_or(FailureCategory::Unknown),
        recent_errors,
        learned_rules,
        last_patch_summary,
        last_delta_summary,
        retry_attempt: record.retry_attempt,
    }
}
