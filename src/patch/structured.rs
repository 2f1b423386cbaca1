//! Structured-edit patch format.
//!
//! An ordered sequence of typed file operations, chosen by the Builder
//! when a phase touches many files or diff context windows become
//! unreliable. `modify_file` carries search/replacement text with
//! unique-match validation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::PatchError;

/// One typed file operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOp {
    CreateFile {
        path: PathBuf,
        contents: String,
    },
    ModifyFile {
        path: PathBuf,
        search: String,
        replacement: String,
    },
    DeleteFile {
        path: PathBuf,
    },
    RenameFile {
        from: PathBuf,
        to: PathBuf,
    },
}

impl EditOp {
    /// Paths this operation touches (rename touches both ends).
    pub fn touched_paths(&self) -> Vec<&PathBuf> {
        match self {
            EditOp::CreateFile { path, .. }
            | EditOp::ModifyFile { path, .. }
            | EditOp::DeleteFile { path } => vec![path],
            EditOp::RenameFile { from, to } => vec![from, to],
        }
    }
}

/// Parse a structured-edit list from its JSON wire form: either a bare
/// array of operations or an object with an `edits` array.
pub fn parse(text: &str) -> Result<Vec<EditOp>, PatchError> {
    #[derive(Deserialize)]
    struct Wrapper {
        edits: Vec<EditOp>,
    }

    let ops = serde_json::from_str::<Vec<EditOp>>(text)
        .or_else(|_| serde_json::from_str::<Wrapper>(text).map(|w| w.edits))
        .map_err(|e| PatchError::Parse(format!("invalid structured edits: {}", e)))?;

    if ops.is_empty() {
        return Err(PatchError::Parse("structured edit list is empty".into()));
    }
    Ok(ops)
}

/// Apply `modify_file` semantics: `search` must match exactly once.
pub fn apply_modify(
    path: &PathBuf,
    contents: &str,
    search: &str,
    replacement: &str,
) -> Result<String, PatchError> {
    let matches = contents.matches(search).count();
    match matches {
        0 => Err(PatchError::ApplyConflict {
            path: path.clone(),
            reason: "search text not found".into(),
        }),
        1 => Ok(contents.replacen(search, replacement, 1)),
        n => Err(PatchError::ApplyConflict {
            path: path.clone(),
            reason: format!("search text matches {} times, expected exactly 1", n),
        }),
    }
}
