//! Save points over the project's git history.
//!
//! A save point is a commit created on the workspace repository before
//! every patch application. Rollback restores the workspace tree
//! byte-for-byte to the save-point commit, removing files created
//! after it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{IndexAddOption, Oid, Repository, ResetType, Signature};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Opaque handle into the workspace's version-controlled history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavePoint {
    /// Commit id of the snapshot
    pub id: String,
    pub phase_id: String,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

/// Creates and restores save points on the workspace repository.
pub struct SavePointEngine {
    repo: Repository,
}

impl SavePointEngine {
    pub fn open(workspace_root: &Path) -> Result<Self> {
        let repo =
            Repository::open(workspace_root).context("Failed to open workspace repository")?;
        Ok(Self { repo })
    }

    /// Initialize a repository if the workspace has none, then open.
    pub fn open_or_init(workspace_root: &Path) -> Result<Self> {
        let repo = match Repository::open(workspace_root) {
            Ok(repo) => repo,
            Err(_) => Repository::init(workspace_root)
                .context("Failed to initialize workspace repository")?,
        };
        Ok(Self { repo })
    }

    /// Snapshot the entire working tree as a commit. Handles the
    /// unborn-branch case for a fresh repository.
    pub fn create(&self, phase_id: &str, attempt: u32) -> Result<SavePoint> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("autopack", "autopack@localhost")?;
        let message = format!("[autopack] save point: phase {} attempt {}", phase_id, attempt);

        let commit_id = if let Some(parent) = self.head_commit() {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?
        } else {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[])?
        };

        Ok(SavePoint {
            id: commit_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt,
            created_at: Utc::now(),
        })
    }

    /// Restore the workspace exactly to the save-point tree. Files
    /// created after the save point are removed; modified files are
    /// overwritten. Fails only on I/O errors, which are fatal to the
    /// enclosing attempt.
    pub fn rollback_to(&self, save_point: &SavePoint) -> Result<()> {
        let oid = Oid::from_str(&save_point.id).context("Invalid save point id")?;
        let commit = self
            .repo
            .find_commit(oid)
            .context("Save point commit not found")?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);

        self.repo
            .reset(commit.as_object(), ResetType::Hard, Some(&mut checkout))
            .context("Failed to roll back to save point")?;
        Ok(())
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Current HEAD commit id, if the branch is born.
    pub fn head_id(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }
}
