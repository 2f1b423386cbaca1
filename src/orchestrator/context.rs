//! Builder context assembly under a per-attempt token budget.
//!
//! Selection is deterministic: files named in `deliverables` first,
//! then files under `scope_paths` ranked by modification recency and
//! then by size, smallest first, until the budget is filled. A budget
//! that cannot even hold the deliverables is a configuration error,
//! surfaced as an infrastructure failure.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use walkdir::WalkDir;

use crate::agents::ContextFile;
use crate::phase::PhaseSpec;

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(
        "context budget of {budget} tokens cannot hold the deliverable files ({required} tokens)"
    )]
    BudgetExceeded { budget: usize, required: usize },
}

pub struct ContextAssembler {
    token_budget: usize,
}

impl ContextAssembler {
    pub fn new(token_budget: usize) -> Self {
        Self { token_budget }
    }

    /// Assemble the context file set for one Builder attempt.
    pub fn assemble(
        &self,
        workspace_root: &Path,
        spec: &PhaseSpec,
    ) -> Result<Vec<ContextFile>, ContextError> {
        let mut files = Vec::new();
        let mut used_tokens = 0usize;
        let mut included: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();

        // Deliverables first, in declared order. These are mandatory:
        // a budget that cannot hold them is a configuration error.
        for deliverable in &spec.deliverables {
            let rel = PathBuf::from(deliverable);
            let Some(contents) = read_text(&workspace_root.join(&rel)) else {
                continue; // not created yet; nothing to include
            };
            used_tokens += estimate_tokens(&contents);
            included.insert(rel.clone());
            files.push(ContextFile { path: rel, contents });
        }
        if used_tokens > self.token_budget {
            return Err(ContextError::BudgetExceeded {
                budget: self.token_budget,
                required: used_tokens,
            });
        }

        // Scope files: most recently modified first, smaller files
        // first within the same timestamp.
        let mut candidates: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        for scope in &spec.scope_paths {
            let base = workspace_root.join(scope.trim_end_matches('/'));
            if !base.exists() {
                continue;
            }
            for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(workspace_root) else {
                    continue;
                };
                let rel = rel.to_path_buf();
                if included.contains(&rel) || is_artifact_path(&rel) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                candidates.push((rel, mtime, meta.len()));
            }
        }
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)));

        for (rel, _, _) in candidates {
            if included.contains(&rel) {
                continue;
            }
            let Some(contents) = read_text(&workspace_root.join(&rel)) else {
                continue;
            };
            let cost = estimate_tokens(&contents);
            if used_tokens + cost > self.token_budget {
                // Budget filled; selection stops here.
                break;
            }
            used_tokens += cost;
            included.insert(rel.clone());
            files.push(ContextFile { path: rel, contents });
        }

        Ok(files)
    }
}

fn is_artifact_path(rel: &Path) -> bool {
    rel.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        name == ".git" || name == ".autopack"
    })
}

fn read_text(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
