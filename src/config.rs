//! Runtime configuration for Autopack.
//!
//! Configuration is resolved in three layers:
//! 1. built-in defaults (the values named in the operations guide),
//! 2. `autopack.toml` in the project directory,
//! 3. `AUTOPACK_*` environment variable overrides.
//!
//! `Config` anchors everything to a project directory and owns the
//! `.autopack/` artifact root (database, logs, run artifacts).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the per-project artifact directory.
pub const AUTOPACK_DIR: &str = ".autopack";

/// Default action applied to an approval request that reaches its
/// timeout without a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDefault {
    Approve,
    #[default]
    Reject,
}

impl std::fmt::Display for ApprovalDefault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalDefault::Approve => write!(f, "approve"),
            ApprovalDefault::Reject => write!(f, "reject"),
        }
    }
}

/// Tunable limits and thresholds. Every field has the documented
/// default and may be overridden in `autopack.toml` or via
/// `AUTOPACK_<FIELD_NAME_UPPERCASE>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Retry / escalation
    pub max_attempts_per_phase: u32,
    pub attempts_per_tier: u32,

    // Re-plan trigger
    pub max_replans_per_phase: u32,
    pub max_replans_per_run: u32,
    pub replan_similarity_threshold: f64,
    pub replan_min_consecutive: usize,
    pub replan_resets_escalation: bool,
    pub fatal_error_types: Vec<String>,

    // Doctor
    pub min_attempts_before_doctor: u32,
    pub doctor_max_per_phase: u32,
    pub doctor_max_per_run: u32,
    pub doctor_strong_max_per_run: u32,
    pub max_builder_attempts_before_complex: u32,
    pub doctor_confidence_threshold: f64,
    pub health_budget_near_limit_ratio: f64,

    // Approval broker
    pub approval_timeout_seconds: u64,
    pub approval_default_on_timeout: ApprovalDefault,
    pub approval_sweep_interval_seconds: u64,
    pub max_governance_rerequests: u32,

    // Governance thresholds
    pub deletion_approval_threshold_lines: usize,
    pub deletion_deny_threshold_lines: usize,
    pub structural_similarity_min: f64,
    pub large_scope_structured_edit_threshold_files: usize,

    // Context assembly
    pub context_token_budget_per_attempt: usize,

    // Run budgets
    pub max_tokens_per_run: u64,
    pub max_wallclock_seconds: u64,

    // External call timeouts
    pub agent_timeout_seconds_cheap: u64,
    pub agent_timeout_seconds_strong: u64,
    pub test_timeout_seconds: u64,

    // Learning store
    pub hint_promotion_min_occurrences: u32,

    /// Globally protected path prefixes, extended per phase. The
    /// version-control metadata, the artifact root and the governance
    /// module source are always included.
    pub protected_paths: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_attempts_per_phase: 5,
            attempts_per_tier: 2,

            max_replans_per_phase: 1,
            max_replans_per_run: 5,
            replan_similarity_threshold: 0.8,
            replan_min_consecutive: 2,
            replan_resets_escalation: true,
            fatal_error_types: vec!["wrong-tech-stack".into(), "schema-mismatch".into()],

            min_attempts_before_doctor: 2,
            doctor_max_per_phase: 2,
            doctor_max_per_run: 10,
            doctor_strong_max_per_run: 5,
            max_builder_attempts_before_complex: 4,
            doctor_confidence_threshold: 0.5,
            health_budget_near_limit_ratio: 0.8,

            approval_timeout_seconds: 900,
            approval_default_on_timeout: ApprovalDefault::Reject,
            approval_sweep_interval_seconds: 5,
            max_governance_rerequests: 1,

            deletion_approval_threshold_lines: 200,
            deletion_deny_threshold_lines: 500,
            structural_similarity_min: 0.6,
            large_scope_structured_edit_threshold_files: 30,

            context_token_budget_per_attempt: 120_000,

            max_tokens_per_run: 5_000_000,
            max_wallclock_seconds: 6 * 60 * 60,

            agent_timeout_seconds_cheap: 300,
            agent_timeout_seconds_strong: 900,
            test_timeout_seconds: 1800,

            hint_promotion_min_occurrences: 3,

            protected_paths: Vec::new(),
        }
    }
}

impl Settings {
    /// Check every numeric option is in range. Called by `config
    /// validate` and before a run starts.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts_per_phase == 0 {
            bail!("max_attempts_per_phase must be at least 1");
        }
        if self.attempts_per_tier == 0 {
            bail!("attempts_per_tier must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.replan_similarity_threshold) {
            bail!(
                "replan_similarity_threshold must be in [0,1], got {}",
                self.replan_similarity_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.structural_similarity_min) {
            bail!(
                "structural_similarity_min must be in [0,1], got {}",
                self.structural_similarity_min
            );
        }
        if !(0.0..=1.0).contains(&self.health_budget_near_limit_ratio) {
            bail!(
                "health_budget_near_limit_ratio must be in [0,1], got {}",
                self.health_budget_near_limit_ratio
            );
        }
        if !(0.0..=1.0).contains(&self.doctor_confidence_threshold) {
            bail!(
                "doctor_confidence_threshold must be in [0,1], got {}",
                self.doctor_confidence_threshold
            );
        }
        if self.deletion_deny_threshold_lines <= self.deletion_approval_threshold_lines {
            bail!(
                "deletion_deny_threshold_lines ({}) must exceed deletion_approval_threshold_lines ({})",
                self.deletion_deny_threshold_lines,
                self.deletion_approval_threshold_lines
            );
        }
        if self.context_token_budget_per_attempt == 0 {
            bail!("context_token_budget_per_attempt must be nonzero");
        }
        if self.replan_min_consecutive == 0 {
            bail!("replan_min_consecutive must be at least 1");
        }
        Ok(())
    }

    /// Apply `AUTOPACK_*` environment overrides on top of the loaded
    /// settings. Unparsable values are rejected rather than ignored.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        fn env_u32(key: &str, slot: &mut u32) -> Result<()> {
            if let Ok(v) = std::env::var(key) {
                *slot = v.parse().with_context(|| format!("Invalid {}: {}", key, v))?;
            }
            Ok(())
        }
        fn env_u64(key: &str, slot: &mut u64) -> Result<()> {
            if let Ok(v) = std::env::var(key) {
                *slot = v.parse().with_context(|| format!("Invalid {}: {}", key, v))?;
            }
            Ok(())
        }
        fn env_usize(key: &str, slot: &mut usize) -> Result<()> {
            if let Ok(v) = std::env::var(key) {
                *slot = v.parse().with_context(|| format!("Invalid {}: {}", key, v))?;
            }
            Ok(())
        }
        fn env_f64(key: &str, slot: &mut f64) -> Result<()> {
            if let Ok(v) = std::env::var(key) {
                *slot = v.parse().with_context(|| format!("Invalid {}: {}", key, v))?;
            }
            Ok(())
        }

        env_u32("AUTOPACK_MAX_ATTEMPTS_PER_PHASE", &mut self.max_attempts_per_phase)?;
        env_u32("AUTOPACK_ATTEMPTS_PER_TIER", &mut self.attempts_per_tier)?;
        env_u32("AUTOPACK_MAX_REPLANS_PER_PHASE", &mut self.max_replans_per_phase)?;
        env_u32("AUTOPACK_MAX_REPLANS_PER_RUN", &mut self.max_replans_per_run)?;
        env_f64(
            "AUTOPACK_REPLAN_SIMILARITY_THRESHOLD",
            &mut self.replan_similarity_threshold,
        )?;
        env_usize(
            "AUTOPACK_REPLAN_MIN_CONSECUTIVE",
            &mut self.replan_min_consecutive,
        )?;
        env_u32(
            "AUTOPACK_MIN_ATTEMPTS_BEFORE_DOCTOR",
            &mut self.min_attempts_before_doctor,
        )?;
        env_u32("AUTOPACK_DOCTOR_MAX_PER_PHASE", &mut self.doctor_max_per_phase)?;
        env_u32("AUTOPACK_DOCTOR_MAX_PER_RUN", &mut self.doctor_max_per_run)?;
        env_u32(
            "AUTOPACK_DOCTOR_STRONG_MAX_PER_RUN",
            &mut self.doctor_strong_max_per_run,
        )?;
        env_u64(
            "AUTOPACK_APPROVAL_TIMEOUT_SECONDS",
            &mut self.approval_timeout_seconds,
        )?;
        if let Ok(v) = std::env::var("AUTOPACK_APPROVAL_DEFAULT_ON_TIMEOUT") {
            self.approval_default_on_timeout = match v.as_str() {
                "approve" => ApprovalDefault::Approve,
                "reject" => ApprovalDefault::Reject,
                other => bail!("Invalid AUTOPACK_APPROVAL_DEFAULT_ON_TIMEOUT: {}", other),
            };
        }
        env_usize(
            "AUTOPACK_DELETION_APPROVAL_THRESHOLD_LINES",
            &mut self.deletion_approval_threshold_lines,
        )?;
        env_usize(
            "AUTOPACK_DELETION_DENY_THRESHOLD_LINES",
            &mut self.deletion_deny_threshold_lines,
        )?;
        env_f64(
            "AUTOPACK_STRUCTURAL_SIMILARITY_MIN",
            &mut self.structural_similarity_min,
        )?;
        env_usize(
            "AUTOPACK_LARGE_SCOPE_STRUCTURED_EDIT_THRESHOLD_FILES",
            &mut self.large_scope_structured_edit_threshold_files,
        )?;
        env_usize(
            "AUTOPACK_CONTEXT_TOKEN_BUDGET_PER_ATTEMPT",
            &mut self.context_token_budget_per_attempt,
        )?;
        env_u64("AUTOPACK_MAX_TOKENS_PER_RUN", &mut self.max_tokens_per_run)?;
        env_u64(
            "AUTOPACK_MAX_WALLCLOCK_SECONDS",
            &mut self.max_wallclock_seconds,
        )?;
        Ok(())
    }
}

/// Configuration for the external agent commands and the test harness.
///
/// Each agent is an executable: the request is written to stdin as JSON
/// and the response is read from stdout as JSON. The harness emits
/// line-oriented results (`pass <id>` / `fail <id>` / `error <id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCommands {
    pub builder_cmd: Vec<String>,
    pub auditor_cmd: Vec<String>,
    pub doctor_cmd: Vec<String>,
    pub replan_cmd: Vec<String>,
    pub harness_cmd: Vec<String>,
}

impl Default for AgentCommands {
    fn default() -> Self {
        Self {
            builder_cmd: vec!["autopack-builder".into()],
            auditor_cmd: vec!["autopack-auditor".into()],
            doctor_cmd: vec!["autopack-doctor".into()],
            replan_cmd: vec!["autopack-replan".into()],
            harness_cmd: vec!["autopack-test".into()],
        }
    }
}

/// The file format of `autopack.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub settings: Settings,
    pub agents: AgentCommands,
}

/// Resolved runtime configuration, anchored to a project directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub autopack_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub settings: Settings,
    pub agents: AgentCommands,
}

impl Config {
    /// Resolve configuration for a project directory: defaults, then
    /// `autopack.toml` if present, then environment overrides.
    pub fn load(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let config_path = project_dir.join("autopack.toml");
        let file: ConfigFile = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            ConfigFile::default()
        };

        let mut settings = file.settings;
        settings.apply_env_overrides()?;
        settings.validate()?;

        let autopack_dir = project_dir.join(AUTOPACK_DIR);
        let db_path = autopack_dir.join("autopack.db");
        let log_dir = autopack_dir.join("logs");

        Ok(Self {
            project_dir,
            autopack_dir,
            db_path,
            log_dir,
            verbose,
            settings,
            agents: file.agents,
        })
    }

    /// Create the artifact directories if they do not exist. The
    /// artifact root is git-ignored so save points never snapshot or
    /// roll back the database and logs.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.autopack_dir)
            .context("Failed to create .autopack directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        let gitignore = self.autopack_dir.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "*\n").context("Failed to write .autopack/.gitignore")?;
        }
        Ok(())
    }

    /// The unconditionally protected path prefixes for this project:
    /// version-control metadata, the artifact root, the database file,
    /// the governance module's own source, plus configured extras.
    pub fn global_protected_paths(&self) -> Vec<String> {
        let mut paths = vec![
            ".git".to_string(),
            AUTOPACK_DIR.to_string(),
            "src/governance".to_string(),
        ];
        paths.extend(self.settings.protected_paths.iter().cloned());
        paths
    }

    /// Path of the advisory lock file guarding this working directory.
    pub fn lock_path(&self) -> PathBuf {
        self.autopack_dir.join("run.lock")
    }
}

/// Locate the config file for display purposes.
pub fn config_file_path(project_dir: &Path) -> PathBuf {
    project_dir.join("autopack.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.max_attempts_per_phase, 5);
        assert_eq!(s.max_replans_per_phase, 1);
        assert_eq!(s.max_replans_per_run, 5);
        assert_eq!(s.replan_similarity_threshold, 0.8);
        assert_eq!(s.replan_min_consecutive, 2);
        assert_eq!(s.doctor_max_per_phase, 2);
        assert_eq!(s.doctor_max_per_run, 10);
        assert_eq!(s.doctor_strong_max_per_run, 5);
        assert_eq!(s.approval_timeout_seconds, 900);
        assert_eq!(s.approval_default_on_timeout, ApprovalDefault::Reject);
        assert_eq!(s.deletion_approval_threshold_lines, 200);
        assert_eq!(s.deletion_deny_threshold_lines, 500);
        assert_eq!(s.structural_similarity_min, 0.6);
        assert_eq!(s.large_scope_structured_edit_threshold_files, 30);
        assert_eq!(s.min_attempts_before_doctor, 2);
        assert_eq!(s.max_builder_attempts_before_complex, 4);
        assert_eq!(s.hint_promotion_min_occurrences, 3);
    }

    #[test]
    fn default_settings_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_similarity() {
        let mut s = Settings::default();
        s.replan_similarity_threshold = 1.5;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("replan_similarity_threshold"));
    }

    #[test]
    fn validate_rejects_inverted_deletion_thresholds() {
        let mut s = Settings::default();
        s.deletion_deny_threshold_lines = 100;
        s.deletion_approval_threshold_lines = 200;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut s = Settings::default();
        s.max_attempts_per_phase = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn load_uses_defaults_without_config_file() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.settings.max_attempts_per_phase, 5);
        assert!(config.db_path.ends_with(".autopack/autopack.db"));
    }

    #[test]
    fn load_reads_toml_overrides() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("autopack.toml"),
            r#"
[settings]
max_attempts_per_phase = 7
replan_similarity_threshold = 0.9

[agents]
builder_cmd = ["my-builder", "--json"]
"#,
        )
        .unwrap();

        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.settings.max_attempts_per_phase, 7);
        assert_eq!(config.settings.replan_similarity_threshold, 0.9);
        assert_eq!(config.agents.builder_cmd, vec!["my-builder", "--json"]);
        // Untouched values keep their defaults
        assert_eq!(config.settings.doctor_max_per_run, 10);
    }

    #[test]
    fn load_rejects_invalid_toml_values() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("autopack.toml"),
            "[settings]\nreplan_similarity_threshold = 3.0\n",
        )
        .unwrap();
        assert!(Config::load(dir.path().to_path_buf(), false).is_err());
    }

    #[test]
    fn global_protected_paths_include_self_protection() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        let protected = config.global_protected_paths();
        assert!(protected.contains(&".git".to_string()));
        assert!(protected.contains(&".autopack".to_string()));
        assert!(protected.contains(&"src/governance".to_string()));
    }

    #[test]
    fn approval_default_parses_from_toml() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("autopack.toml"),
            "[settings]\napproval_default_on_timeout = \"approve\"\n",
        )
        .unwrap();
        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(
            config.settings.approval_default_on_timeout,
            ApprovalDefault::Approve
        );
    }
}
