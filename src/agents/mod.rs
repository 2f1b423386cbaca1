//! External agent contracts: Builder, Auditor, Doctor and Re-plan are
//! LLM-backed collaborators reached through narrow traits, plus the
//! process-backed implementation that spawns a configured command and
//! speaks JSON over stdin/stdout.
//!
//! The orchestrator core never sees a provider SDK; it sees these
//! traits and the tagged-variant response types below.

use anyhow::Context;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{FailureCategory, InfraError, PatchError};
use crate::patch::{ApplyReport, Patch};
use crate::phase::{Complexity, ErrorRecord, PhaseSpec};

/// Model tiers, progressing cheap -> mid -> strong -> strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Cheap,
    Mid,
    Strong,
    Strongest,
}

impl ModelTier {
    /// The configured model map: base tier from phase complexity,
    /// bumped once per escalation level, saturating at the top.
    pub fn select(complexity: Complexity, escalation_level: u32) -> Self {
        let base = match complexity {
            Complexity::Low => 0u32,
            Complexity::Medium => 1,
            Complexity::High => 2,
        };
        match base.saturating_add(escalation_level).min(3) {
            0 => ModelTier::Cheap,
            1 => ModelTier::Mid,
            2 => ModelTier::Strong,
            _ => ModelTier::Strongest,
        }
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, ModelTier::Strong | ModelTier::Strongest)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Cheap => "cheap",
            ModelTier::Mid => "mid",
            ModelTier::Strong => "strong",
            ModelTier::Strongest => "strongest",
        }
    }
}

/// One file included in the Builder context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFile {
    pub path: PathBuf,
    pub contents: String,
}

/// The request handed to the Builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderRequest {
    pub goal: String,
    pub acceptance_criteria: Vec<String>,
    pub scope_paths: Vec<String>,
    pub deliverables: Vec<String>,
    pub context_files: Vec<ContextFile>,
    /// Learned rules and run hints, already rendered to text
    pub rules: Vec<String>,
    pub hints: Vec<String>,
    pub tier: ModelTier,
    /// Set when the phase touches enough files that unified-diff
    /// context windows become unreliable; the Builder should answer
    /// with structured edits.
    pub prefer_structured_edits: bool,
}

/// What the Builder returns: a raw patch plus accounting metadata.
/// Parsing is deferred so a malformed patch surfaces as a
/// patch-format failure, not an infrastructure one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchBundle {
    pub raw_patch: String,
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
}

impl PatchBundle {
    pub fn parse(&self) -> Result<Patch, PatchError> {
        Patch::parse(&self.raw_patch)
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// One issue raised by the Auditor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: String,
    pub message: String,
}

/// Auditor output: a structured risk/issue list, treated opaquely by
/// the orchestrator and consumed by governance and the finalizer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReport {
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub issues: Vec<QualityIssue>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
}

/// The evidence bundle assembled for a Doctor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorEvidence {
    pub phase_id: String,
    pub goal: String,
    pub failure_category: FailureCategory,
    pub recent_errors: Vec<ErrorRecord>,
    pub learned_rules: Vec<String>,
    pub last_patch_summary: Option<String>,
    pub last_delta_summary: Option<String>,
    pub retry_attempt: u32,
}

/// The Doctor's chosen action: exactly one from a fixed vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DoctorAction {
    RetryWithFix { hint: String },
    Replan,
    SkipPhase { reason: String },
    FatalError { reason: String },
    RollbackProvider { provider_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorResponse {
    #[serde(flatten)]
    pub action: DoctorAction,
    /// Confidence in [0, 1]
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
}

/// A goal revision proposed by the re-plan agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisedPhase {
    pub goal: String,
    pub deliverables: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub scope_paths: Vec<String>,
}

/// Re-plan agent output: a revision, or a refusal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplanReply {
    Revised { phase: RevisedPhase },
    Refused { reason: String },
}

#[async_trait]
pub trait BuilderAgent: Send + Sync {
    async fn build(&self, request: &BuilderRequest) -> Result<PatchBundle, InfraError>;
}

#[async_trait]
pub trait AuditorAgent: Send + Sync {
    async fn audit(
        &self,
        report: &ApplyReport,
        phase: &PhaseSpec,
    ) -> Result<QualityReport, InfraError>;
}

#[async_trait]
pub trait DoctorAgent: Send + Sync {
    async fn diagnose(
        &self,
        evidence: &DoctorEvidence,
        tier: ModelTier,
    ) -> Result<DoctorResponse, InfraError>;
}

#[async_trait]
pub trait ReplanAgent: Send + Sync {
    async fn revise(
        &self,
        phase: &PhaseSpec,
        original_intent: &str,
        error_history: &[ErrorRecord],
    ) -> Result<ReplanReply, InfraError>;
}

/// Tracks which LLM providers are live. `rollback_provider` disables
/// one for the remainder of the run.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: Vec<String>,
    disabled: Mutex<HashSet<String>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<String>) -> Self {
        Self {
            providers,
            disabled: Mutex::new(HashSet::new()),
        }
    }

    /// The first provider that has not been disabled.
    pub fn active(&self) -> Option<String> {
        let disabled = self.disabled.lock().expect("provider lock poisoned");
        self.providers
            .iter()
            .find(|p| !disabled.contains(*p))
            .cloned()
    }

    pub fn disable(&self, provider_id: &str) {
        self.disabled
            .lock()
            .expect("provider lock poisoned")
            .insert(provider_id.to_string());
    }

    pub fn is_disabled(&self, provider_id: &str) -> bool {
        self.disabled
            .lock()
            .expect("provider lock poisoned")
            .contains(provider_id)
    }
}

/// An agent backed by an external command: the request is written to
/// stdin as JSON and the response is read from stdout as JSON. Cheap
/// and strong tiers carry separate wall-clock timeouts.
pub struct CommandAgent {
    cmd: Vec<String>,
    workdir: PathBuf,
    cheap_timeout: Duration,
    strong_timeout: Duration,
    provider: String,
}

impl CommandAgent {
    pub fn new(
        cmd: Vec<String>,
        workdir: PathBuf,
        cheap_timeout: Duration,
        strong_timeout: Duration,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            cmd,
            workdir,
            cheap_timeout,
            strong_timeout,
            provider: provider.into(),
        }
    }

    fn timeout_for(&self, tier: ModelTier) -> Duration {
        if tier.is_strong() {
            self.strong_timeout
        } else {
            self.cheap_timeout
        }
    }

    async fn invoke_json<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp, InfraError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let (program, args) = self.cmd.split_first().ok_or_else(|| {
            InfraError::AgentProvider {
                provider: self.provider.clone(),
                message: "agent command is empty".into(),
            }
        })?;

        let payload = serde_json::to_vec(request).map_err(|e| InfraError::AgentProvider {
            provider: self.provider.clone(),
            message: format!("failed to encode request: {}", e),
        })?;

        let run = async {
            let mut child = Command::new(program)
                .args(args)
                .current_dir(&self.workdir)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .context("Failed to spawn agent process")?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&payload)
                    .await
                    .context("Failed to write agent request")?;
                stdin.shutdown().await.context("Failed to close stdin")?;
            }

            let output = child
                .wait_with_output()
                .await
                .context("Failed to read agent output")?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!(
                    "agent exited with code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                );
            }

            debug!(bytes = output.stdout.len(), "agent response received");
            serde_json::from_slice::<Resp>(&output.stdout)
                .context("Failed to parse agent response JSON")
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(InfraError::AgentProvider {
                provider: self.provider.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(InfraError::AgentTimeout {
                provider: self.provider.clone(),
                seconds: timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl BuilderAgent for CommandAgent {
    async fn build(&self, request: &BuilderRequest) -> Result<PatchBundle, InfraError> {
        let timeout = self.timeout_for(request.tier);
        let mut bundle: PatchBundle = self.invoke_json(request, timeout).await?;
        if bundle.provider.is_empty() {
            bundle.provider = self.provider.clone();
        }
        Ok(bundle)
    }
}

#[async_trait]
impl AuditorAgent for CommandAgent {
    async fn audit(
        &self,
        report: &ApplyReport,
        phase: &PhaseSpec,
    ) -> Result<QualityReport, InfraError> {
        #[derive(Serialize)]
        struct AuditRequest<'a> {
            report: &'a ApplyReport,
            phase: &'a PhaseSpec,
        }
        self.invoke_json(&AuditRequest { report, phase }, self.cheap_timeout)
            .await
    }
}

#[async_trait]
impl DoctorAgent for CommandAgent {
    async fn diagnose(
        &self,
        evidence: &DoctorEvidence,
        tier: ModelTier,
    ) -> Result<DoctorResponse, InfraError> {
        #[derive(Serialize)]
        struct DiagnoseRequest<'a> {
            evidence: &'a DoctorEvidence,
            tier: ModelTier,
        }
        self.invoke_json(&DiagnoseRequest { evidence, tier }, self.timeout_for(tier))
            .await
    }
}

#[async_trait]
impl ReplanAgent for CommandAgent {
    async fn revise(
        &self,
        phase: &PhaseSpec,
        original_intent: &str,
        error_history: &[ErrorRecord],
    ) -> Result<ReplanReply, InfraError> {
        #[derive(Serialize)]
        struct ReviseRequest<'a> {
            phase: &'a PhaseSpec,
            original_intent: &'a str,
            error_history: &'a [ErrorRecord],
        }
        self.invoke_json(
            &ReviseRequest {
                phase,
                original_intent,
                error_history,
            },
            self.strong_timeout,
        )
        .await
    }
}
