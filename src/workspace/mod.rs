//! Workspace gateway: the sole path through which the file tree is
//! read or mutated.
//!
//! Every target path is classified as protected / in-scope /
//! out-of-scope for the current phase. Mutations of protected or
//! out-of-scope paths fail unless a matching governance exception
//! token is presented. Save points and rollback live in
//! [`savepoint`].

mod savepoint;

pub use savepoint::{SavePoint, SavePointEngine};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::errors::GovernanceError;

/// Classification of a workspace-relative path for the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathClass {
    Protected,
    InScope,
    OutOfScope,
}

/// A one-shot authorization for a specific out-of-scope or
/// protected-path write, emitted by the approval broker on human
/// approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionToken {
    pub token_id: String,
    pub path: String,
    pub phase_id: String,
}

impl ExceptionToken {
    pub fn new(path: impl Into<String>, phase_id: impl Into<String>) -> Self {
        Self {
            token_id: Uuid::new_v4().to_string(),
            path: path.into(),
            phase_id: phase_id.into(),
        }
    }

    /// Whether this token unlocks the given workspace-relative path.
    pub fn covers(&self, path: &Path) -> bool {
        path == Path::new(&self.path)
    }
}

/// Path classification rules for one phase: the global protected set,
/// the phase's extra protected paths and its scope prefixes.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    protected: Vec<String>,
    scope: Vec<String>,
}

impl PathPolicy {
    pub fn new(global_protected: Vec<String>, phase_protected: Vec<String>, scope: Vec<String>) -> Self {
        let mut protected = global_protected;
        protected.extend(phase_protected);
        Self { protected, scope }
    }

    /// Prefix match against a workspace-relative path. An entry
    /// matches the path itself or any path beneath it.
    fn matches_prefix(entry: &str, path: &Path) -> bool {
        let entry = Path::new(entry.trim_end_matches('/'));
        path == entry || path.starts_with(entry)
    }

    pub fn classify(&self, path: &Path) -> PathClass {
        if self.protected.iter().any(|p| Self::matches_prefix(p, path)) {
            return PathClass::Protected;
        }
        if self.scope.iter().any(|p| Self::matches_prefix(p, path)) {
            return PathClass::InScope;
        }
        PathClass::OutOfScope
    }
}

/// The gateway. Owns the workspace root, the classification policy and
/// the per-run mutation lock. The run orchestrator additionally holds
/// an advisory file lock on the working directory so no second process
/// mutates the same workspace.
pub struct WorkspaceGateway {
    root: PathBuf,
    policy: PathPolicy,
    mutation_lock: Mutex<()>,
}

impl WorkspaceGateway {
    pub fn new(root: PathBuf, policy: PathPolicy) -> Result<Self> {
        let root = root
            .canonicalize()
            .context("Failed to resolve workspace root")?;
        Ok(Self {
            root,
            policy,
            mutation_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classify(&self, path: &Path) -> PathClass {
        self.policy.classify(path)
    }

    /// Reject absolute paths and any traversal outside the root.
    fn resolve(&self, rel: &Path) -> Result<PathBuf, GovernanceError> {
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(GovernanceError::ScopeViolation {
                path: rel.to_path_buf(),
            });
        }
        Ok(self.root.join(rel))
    }

    /// Classification plus token check: the gate every mutation passes.
    fn authorize(&self, rel: &Path, tokens: &[ExceptionToken]) -> Result<(), GovernanceError> {
        match self.classify(rel) {
            PathClass::InScope => Ok(()),
            PathClass::Protected => {
                if tokens.iter().any(|t| t.covers(rel)) {
                    Ok(())
                } else {
                    Err(GovernanceError::ProtectedPathViolation {
                        path: rel.to_path_buf(),
                    })
                }
            }
            PathClass::OutOfScope => {
                if tokens.iter().any(|t| t.covers(rel)) {
                    Ok(())
                } else {
                    Err(GovernanceError::ScopeViolation {
                        path: rel.to_path_buf(),
                    })
                }
            }
        }
    }

    /// Read a file. Reads are not scope-gated; the Builder context
    /// assembly needs visibility of the tree.
    pub fn read(&self, rel: &Path) -> Result<Option<Vec<u8>>> {
        let full = self
            .resolve(rel)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        match std::fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", rel.display())),
        }
    }

    pub fn exists(&self, rel: &Path) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn write(
        &self,
        rel: &Path,
        bytes: &[u8],
        tokens: &[ExceptionToken],
    ) -> Result<(), GovernanceError> {
        self.authorize(rel, tokens)?;
        let _guard = self.mutation_lock.lock().expect("mutation lock poisoned");
        let full = self.resolve(rel)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GovernanceError::Denied {
                reason: format!("I/O error creating {}: {}", rel.display(), e),
            })?;
        }
        std::fs::write(&full, bytes).map_err(|e| GovernanceError::Denied {
            reason: format!("I/O error writing {}: {}", rel.display(), e),
        })
    }

    pub fn delete(&self, rel: &Path, tokens: &[ExceptionToken]) -> Result<(), GovernanceError> {
        self.authorize(rel, tokens)?;
        let _guard = self.mutation_lock.lock().expect("mutation lock poisoned");
        let full = self.resolve(rel)?;
        if full.exists() {
            std::fs::remove_file(&full).map_err(|e| GovernanceError::Denied {
                reason: format!("I/O error deleting {}: {}", rel.display(), e),
            })?;
        }
        Ok(())
    }

    /// A rename counts as a delete of the source and a write at the
    /// destination; both sides are authorized.
    pub fn rename(
        &self,
        from: &Path,
        to: &Path,
        tokens: &[ExceptionToken],
    ) -> Result<(), GovernanceError> {
        self.authorize(from, tokens)?;
        self.authorize(to, tokens)?;
        let _guard = self.mutation_lock.lock().expect("mutation lock poisoned");
        let from_full = self.resolve(from)?;
        let to_full = self.resolve(to)?;
        if let Some(parent) = to_full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GovernanceError::Denied {
                reason: format!("I/O error creating {}: {}", to.display(), e),
            })?;
        }
        std::fs::rename(&from_full, &to_full).map_err(|e| GovernanceError::Denied {
            reason: format!(
                "I/O error renaming {} to {}: {}",
                from.display(),
                to.display(),
                e
            ),
        })
    }
}
