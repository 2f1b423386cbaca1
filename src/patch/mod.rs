//! Patch engine: parses Builder output and applies it through the
//! workspace gateway.
//!
//! Two input formats are supported:
//! - unified diffs ([`unified`])
//! - structured edit lists ([`structured`])
//!
//! The engine works in two stages. `plan` parses the patch, computes
//! every prospective file state in memory and runs the symbol
//! preservation and structural similarity checks, producing an
//! [`ApplyReport`] with risk flags but touching nothing. `apply`
//! creates a save point and writes the planned changes through the
//! gateway, rolling back the save point if any operation fails.

pub mod structured;
pub mod symbols;
pub mod unified;

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::PatchError;
use crate::workspace::{
    ExceptionToken, PathClass, SavePoint, SavePointEngine, WorkspaceGateway,
};
use structured::EditOp;

/// A Builder-produced patch in one of the two wire formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum Patch {
    UnifiedDiff { diff: String },
    StructuredEdits { edits: Vec<EditOp> },
}

impl Patch {
    /// Parse the raw wire form: structured edits are JSON, anything
    /// else is treated as a unified diff.
    pub fn parse(raw: &str) -> Result<Self, PatchError> {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            Ok(Patch::StructuredEdits {
                edits: structured::parse(raw)?,
            })
        } else {
            // Validate eagerly so a malformed diff is a parse error at
            // intake, not at plan time.
            unified::parse(raw)?;
            Ok(Patch::UnifiedDiff {
                diff: raw.to_string(),
            })
        }
    }
}

/// The kind of change planned for one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Rename { from: PathBuf },
}

/// One planned file-state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub old_contents: Option<String>,
    pub new_contents: Option<String>,
}

/// A symbol-preservation violation: a named top-level symbol deleted
/// without reappearing anywhere else in the same patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolDeletionFlag {
    pub path: PathBuf,
    pub symbol: String,
}

/// A structural-drift violation: the patched skeleton overlaps the
/// original below the configured minimum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralDriftFlag {
    pub path: PathBuf,
    pub similarity: f64,
}

/// What a patch did (or would do): the single artifact governance and
/// the finalizer consume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub files_renamed: Vec<(PathBuf, PathBuf)>,
    pub lines_added: usize,
    pub lines_deleted: usize,
    pub symbol_deletions: Vec<SymbolDeletionFlag>,
    pub structural_drift: Vec<StructuralDriftFlag>,
    /// Targets classified protected for the current phase
    pub protected_targets: Vec<PathBuf>,
    /// Targets classified outside the current phase scope
    pub out_of_scope_targets: Vec<PathBuf>,
}

impl ApplyReport {
    /// Net lines removed; zero when the patch grows the tree.
    pub fn net_deletion(&self) -> usize {
        self.lines_deleted.saturating_sub(self.lines_added)
    }

    pub fn total_files(&self) -> usize {
        self.files_created.len()
            + self.files_modified.len()
            + self.files_deleted.len()
            + self.files_renamed.len()
    }

    pub fn has_governance_flags(&self) -> bool {
        !self.symbol_deletions.is_empty()
            || !self.structural_drift.is_empty()
            || !self.protected_targets.is_empty()
            || !self.out_of_scope_targets.is_empty()
    }
}

/// The output of `plan`: everything needed to apply, plus the
/// prospective report.
#[derive(Debug, Clone)]
pub struct PatchPlan {
    pub changes: Vec<PlannedChange>,
    pub report: ApplyReport,
}

/// The patch application engine.
pub struct PatchEngine {
    structural_similarity_min: f64,
}

impl PatchEngine {
    pub fn new(structural_similarity_min: f64) -> Self {
        Self {
            structural_similarity_min,
        }
    }

    /// Stage one: parse and simulate the patch against current
    /// workspace contents. Nothing is written. Returns the planned
    /// changes plus an [`ApplyReport`] carrying governance flags.
    pub fn plan(
        &self,
        patch: &Patch,
        gateway: &WorkspaceGateway,
    ) -> Result<PatchPlan, PatchError> {
        let changes = match patch {
            Patch::UnifiedDiff { diff } => self.plan_unified(diff, gateway)?,
            Patch::StructuredEdits { edits } => self.plan_structured(edits, gateway)?,
        };
        let report = self.build_report(&changes, gateway);
        Ok(PatchPlan { changes, report })
    }

    fn read_text(gateway: &WorkspaceGateway, path: &Path) -> Result<Option<String>, PatchError> {
        let bytes = gateway.read(path).map_err(|e| PatchError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        })?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    fn plan_unified(
        &self,
        diff: &str,
        gateway: &WorkspaceGateway,
    ) -> Result<Vec<PlannedChange>, PatchError> {
        let file_patches = unified::parse(diff)?;
        let mut changes = Vec::with_capacity(file_patches.len());

        for fp in &file_patches {
            let target = fp.target().clone();
            let old_contents = Self::read_text(gateway, &target)?;
            let new_contents = unified::apply(fp, old_contents.as_deref())?;
            let kind = match (&old_contents, &new_contents) {
                (None, Some(_)) => ChangeKind::Create,
                (Some(_), None) => ChangeKind::Delete,
                (Some(_), Some(_)) => ChangeKind::Modify,
                (None, None) => continue,
            };
            changes.push(PlannedChange {
                path: target,
                kind,
                old_contents,
                new_contents,
            });
        }
        Ok(changes)
    }

    fn plan_structured(
        &self,
        edits: &[EditOp],
        gateway: &WorkspaceGateway,
    ) -> Result<Vec<PlannedChange>, PatchError> {
        // In-memory view: path -> current simulated contents. Ops can
        // chain (create then modify the same file).
        let mut view: BTreeMap<PathBuf, Option<String>> = BTreeMap::new();
        let mut originals: BTreeMap<PathBuf, Option<String>> = BTreeMap::new();
        let mut renames: Vec<(PathBuf, PathBuf)> = Vec::new();

        let load = |path: &PathBuf,
                        view: &mut BTreeMap<PathBuf, Option<String>>,
                        originals: &mut BTreeMap<PathBuf, Option<String>>|
         -> Result<(), PatchError> {
            if !view.contains_key(path) {
                let contents = Self::read_text(gateway, path)?;
                originals.insert(path.clone(), contents.clone());
                view.insert(path.clone(), contents);
            }
            Ok(())
        };

        for op in edits {
            match op {
                EditOp::CreateFile { path, contents } => {
                    load(path, &mut view, &mut originals)?;
                    if view.get(path).and_then(|c| c.as_ref()).is_some() {
                        return Err(PatchError::ApplyConflict {
                            path: path.clone(),
                            reason: "create_file target already exists".into(),
                        });
                    }
                    view.insert(path.clone(), Some(contents.clone()));
                }
                EditOp::ModifyFile {
                    path,
                    search,
                    replacement,
                } => {
                    load(path, &mut view, &mut originals)?;
                    let Some(Some(current)) = view.get(path).cloned() else {
                        return Err(PatchError::ApplyConflict {
                            path: path.clone(),
                            reason: "modify_file target does not exist".into(),
                        });
                    };
                    let updated = structured::apply_modify(path, &current, search, replacement)?;
                    view.insert(path.clone(), Some(updated));
                }
                EditOp::DeleteFile { path } => {
                    load(path, &mut view, &mut originals)?;
                    if view.get(path).and_then(|c| c.as_ref()).is_none() {
                        return Err(PatchError::ApplyConflict {
                            path: path.clone(),
                            reason: "delete_file target does not exist".into(),
                        });
                    }
                    view.insert(path.clone(), None);
                }
                EditOp::RenameFile { from, to } => {
                    load(from, &mut view, &mut originals)?;
                    load(to, &mut view, &mut originals)?;
                    let Some(Some(contents)) = view.get(from).cloned() else {
                        return Err(PatchError::ApplyConflict {
                            path: from.clone(),
                            reason: "rename_file source does not exist".into(),
                        });
                    };
                    if view.get(to).and_then(|c| c.as_ref()).is_some() {
                        return Err(PatchError::ApplyConflict {
                            path: to.clone(),
                            reason: "rename_file destination already exists".into(),
                        });
                    }
                    view.insert(from.clone(), None);
                    view.insert(to.clone(), Some(contents));
                    renames.push((from.clone(), to.clone()));
                }
            }
        }

        let mut changes = Vec::new();
        for (path, new_contents) in view {
            let old_contents = originals.get(&path).cloned().flatten();
            let rename_to = renames.iter().find(|(from, _)| from == &path);
            let rename_from = renames.iter().find(|(_, to)| to == &path);

            let kind = match (&old_contents, &new_contents, rename_to, rename_from) {
                // Rename source: suppressed, the destination entry
                // carries the rename.
                (_, None, Some(_), _) => continue,
                (_, Some(_), _, Some((from, _))) => ChangeKind::Rename { from: from.clone() },
                (None, Some(_), _, _) => ChangeKind::Create,
                (Some(_), None, _, _) => ChangeKind::Delete,
                (Some(old), Some(new), _, _) => {
                    if old == new {
                        continue;
                    }
                    ChangeKind::Modify
                }
                (None, None, _, _) => continue,
            };
            changes.push(PlannedChange {
                path,
                kind,
                old_contents,
                new_contents,
            });
        }
        Ok(changes)
    }

    fn count_lines(change: &PlannedChange) -> (usize, usize) {
        match (&change.old_contents, &change.new_contents) {
            (None, Some(new)) => (new.lines().count(), 0),
            (Some(old), None) => (0, old.lines().count()),
            (Some(old), Some(new)) => {
                let diff = TextDiff::from_lines(old.as_str(), new.as_str());
                let mut added = 0;
                let mut deleted = 0;
                for op in diff.iter_all_changes() {
                    match op.tag() {
                        ChangeTag::Insert => added += 1,
                        ChangeTag::Delete => deleted += 1,
                        ChangeTag::Equal => {}
                    }
                }
                (added, deleted)
            }
            (None, None) => (0, 0),
        }
    }

    fn build_report(
        &self,
        changes: &[PlannedChange],
        gateway: &WorkspaceGateway,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();

        // Symbols present in any post-patch file; a symbol deleted in
        // one file but re-created in another (a move) is preserved.
        let mut all_new_symbols: std::collections::BTreeSet<String> =
            std::collections::BTreeSet::new();
        for change in changes {
            if let Some(new) = &change.new_contents {
                all_new_symbols.extend(symbols::extract_symbols(new));
            }
        }

        for change in changes {
            match &change.kind {
                ChangeKind::Create => report.files_created.push(change.path.clone()),
                ChangeKind::Modify => report.files_modified.push(change.path.clone()),
                ChangeKind::Delete => report.files_deleted.push(change.path.clone()),
                ChangeKind::Rename { from } => {
                    report
                        .files_renamed
                        .push((from.clone(), change.path.clone()));
                }
            }

            let (added, deleted) = Self::count_lines(change);
            report.lines_added += added;
            report.lines_deleted += deleted;

            if let (Some(old), Some(new)) = (&change.old_contents, &change.new_contents) {
                let old_skel = symbols::Skeleton::of(old);
                let new_skel = symbols::Skeleton::of(new);

                for symbol in old_skel.missing_from(&new_skel) {
                    if !all_new_symbols.contains(symbol) {
                        report.symbol_deletions.push(SymbolDeletionFlag {
                            path: change.path.clone(),
                            symbol: symbol.to_string(),
                        });
                    }
                }

                let similarity = old_skel.overlap_with(&new_skel);
                if similarity < self.structural_similarity_min {
                    report.structural_drift.push(StructuralDriftFlag {
                        path: change.path.clone(),
                        similarity,
                    });
                }
            }

            // Classification for governance: rename checks both ends.
            let mut targets = vec![change.path.clone()];
            if let ChangeKind::Rename { from } = &change.kind {
                targets.push(from.clone());
            }
            for target in targets {
                match gateway.classify(&target) {
                    PathClass::Protected => report.protected_targets.push(target),
                    PathClass::OutOfScope => report.out_of_scope_targets.push(target),
                    PathClass::InScope => {}
                }
            }
        }

        report
    }

    /// Stage two: create a save point and write the planned changes
    /// through the gateway. All operations succeed or the save point
    /// is restored.
    pub fn apply(
        &self,
        plan: &PatchPlan,
        gateway: &WorkspaceGateway,
        save_points: &SavePointEngine,
        phase_id: &str,
        attempt: u32,
        tokens: &[ExceptionToken],
    ) -> Result<(SavePoint, ApplyReport), PatchError> {
        let save_point = save_points
            .create(phase_id, attempt)
            .map_err(|e| PatchError::Io {
                path: gateway.root().to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })?;

        for change in &plan.changes {
            let result = match (&change.kind, &change.new_contents) {
                (ChangeKind::Rename { from }, Some(contents)) => gateway
                    .rename(from, &change.path, tokens)
                    .and_then(|_| gateway.write(&change.path, contents.as_bytes(), tokens)),
                (ChangeKind::Delete, _) => gateway.delete(&change.path, tokens),
                (_, Some(contents)) => gateway.write(&change.path, contents.as_bytes(), tokens),
                (_, None) => gateway.delete(&change.path, tokens),
            };

            if let Err(violation) = result {
                // Atomicity: anything already written is undone.
                if let Err(rollback_err) = save_points.rollback_to(&save_point) {
                    return Err(PatchError::Io {
                        path: change.path.clone(),
                        source: std::io::Error::other(format!(
                            "rollback failed after {}: {}",
                            violation, rollback_err
                        )),
                    });
                }
                return Err(PatchError::Governance(violation));
            }
        }

        Ok((save_point, plan.report.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::PathPolicy;
    use std::fs;
    use tempfile::tempdir;

    fn setup(scope: &[&str]) -> (WorkspaceGateway, SavePointEngine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        drop(repo);

        let policy = PathPolicy::new(
            vec![".git".into(), ".autopack".into()],
            vec![],
            scope.iter().map(|s| s.to_string()).collect(),
        );
        let gateway = WorkspaceGateway::new(dir.path().to_path_buf(), policy).unwrap();
        let save_points = SavePointEngine::open(dir.path()).unwrap();
        (gateway, save_points, dir)
    }

    fn engine() -> PatchEngine {
        PatchEngine::new(0.6)
    }

    #[test]
    fn patch_parse_dispatches_on_shape() {
        let diff = "--- a/x.rs\n+++ b/x.rs\n@@ -1,1 +1,1 @@\n-a\n+b\n";
        assert!(matches!(
            Patch::parse(diff).unwrap(),
            Patch::UnifiedDiff { .. }
        ));

        let edits = r#"[{"op": "create_file", "path": "x.rs", "contents": "a"}]"#;
        assert!(matches!(
            Patch::parse(edits).unwrap(),
            Patch::StructuredEdits { .. }
        ));

        assert!(Patch::parse("garbage").is_err());
    }

    #[test]
    fn plan_unified_create() {
        let (gateway, _sp, _dir) = setup(&["src/"]);
        let patch = Patch::parse(
            "--- /dev/null\n+++ b/src/new.rs\n@@ -0,0 +1,1 @@\n+fn created() {}\n",
        )
        .unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        assert_eq!(plan.report.files_created, vec![PathBuf::from("src/new.rs")]);
        assert_eq!(plan.report.lines_added, 1);
        assert!(plan.report.out_of_scope_targets.is_empty());
    }

    #[test]
    fn plan_flags_out_of_scope_targets() {
        let (gateway, _sp, _dir) = setup(&["src/"]);
        let patch = Patch::parse(
            "--- /dev/null\n+++ b/docs/readme.md\n@@ -0,0 +1,1 @@\n+hello\n",
        )
        .unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        assert_eq!(
            plan.report.out_of_scope_targets,
            vec![PathBuf::from("docs/readme.md")]
        );
    }

    #[test]
    fn plan_flags_protected_targets() {
        let (gateway, _sp, _dir) = setup(&["src/"]);
        let patch = Patch::parse(
            "--- /dev/null\n+++ b/.autopack/evil.txt\n@@ -0,0 +1,1 @@\n+x\n",
        )
        .unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        assert_eq!(
            plan.report.protected_targets,
            vec![PathBuf::from(".autopack/evil.txt")]
        );
    }

    #[test]
    fn plan_flags_symbol_deletion() {
        let (gateway, _sp, dir) = setup(&["src/"]);
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/lib.rs"),
            "fn keep() {}\nfn gone() {}\n",
        )
        .unwrap();

        let edits = r#"[{"op": "modify_file", "path": "src/lib.rs",
            "search": "fn keep() {}\nfn gone() {}\n",
            "replacement": "fn keep() {}\n"}]"#;
        let patch = Patch::parse(edits).unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        assert_eq!(plan.report.symbol_deletions.len(), 1);
        assert_eq!(plan.report.symbol_deletions[0].symbol, "gone");
    }

    #[test]
    fn moved_symbol_is_not_flagged() {
        let (gateway, _sp, dir) = setup(&["src/"]);
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/lib.rs"),
            "fn keep() {}\nfn moved() {}\n",
        )
        .unwrap();

        let edits = r#"[
            {"op": "modify_file", "path": "src/lib.rs",
             "search": "fn keep() {}\nfn moved() {}\n",
             "replacement": "fn keep() {}\n"},
            {"op": "create_file", "path": "src/util.rs",
             "contents": "fn moved() {}\n"}
        ]"#;
        let patch = Patch::parse(edits).unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        assert!(plan.report.symbol_deletions.is_empty());
    }

    #[test]
    fn plan_flags_structural_drift() {
        let (gateway, _sp, dir) = setup(&["src/"]);
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/lib.rs"),
            "use std::fs;\nfn a() {}\nfn b() {}\nfn c() {}\n",
        )
        .unwrap();

        // Replace nearly everything: overlap 1/4 < 0.6.
        let edits = r#"[{"op": "modify_file", "path": "src/lib.rs",
            "search": "use std::fs;\nfn a() {}\nfn b() {}\nfn c() {}\n",
            "replacement": "fn a() {}\nfn x() {}\nfn y() {}\nfn z() {}\n"}]"#;
        let patch = Patch::parse(edits).unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        assert_eq!(plan.report.structural_drift.len(), 1);
        assert!(plan.report.structural_drift[0].similarity < 0.6);
        // The deleted symbols are also reported individually.
        assert!(!plan.report.symbol_deletions.is_empty());
    }

    #[test]
    fn apply_writes_files_and_returns_save_point() {
        let (gateway, save_points, dir) = setup(&["src/"]);
        fs::write(dir.path().join("seed.txt"), "seed").unwrap();

        let patch = Patch::parse(
            "--- /dev/null\n+++ b/src/new.rs\n@@ -0,0 +1,1 @@\n+fn created() {}\n",
        )
        .unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        let (sp, report) = engine()
            .apply(&plan, &gateway, &save_points, "phase-1", 0, &[])
            .unwrap();

        assert!(!sp.id.is_empty());
        assert_eq!(report.files_created.len(), 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/new.rs")).unwrap(),
            "fn created() {}\n"
        );
    }

    #[test]
    fn apply_rolls_back_on_violation() {
        let (gateway, save_points, dir) = setup(&["src/"]);
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/ok.rs"), "original").unwrap();

        // Second op violates scope: the first write must be undone.
        let edits = r#"[
            {"op": "modify_file", "path": "src/ok.rs",
             "search": "original", "replacement": "patched"},
            {"op": "create_file", "path": "docs/outside.md", "contents": "x"}
        ]"#;
        let patch = Patch::parse(edits).unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        let err = engine()
            .apply(&plan, &gateway, &save_points, "phase-1", 0, &[])
            .unwrap_err();

        assert!(matches!(err, PatchError::Governance(_)));
        assert_eq!(
            fs::read_to_string(dir.path().join("src/ok.rs")).unwrap(),
            "original"
        );
        assert!(!dir.path().join("docs/outside.md").exists());
    }

    #[test]
    fn apply_honors_exception_tokens() {
        let (gateway, save_points, dir) = setup(&["src/"]);
        fs::write(dir.path().join("seed.txt"), "seed").unwrap();

        let patch = Patch::parse(
            "--- /dev/null\n+++ b/docs/outside.md\n@@ -0,0 +1,1 @@\n+granted\n",
        )
        .unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        let token = ExceptionToken::new("docs/outside.md", "phase-1");
        let (_sp, _report) = engine()
            .apply(&plan, &gateway, &save_points, "phase-1", 0, &[token])
            .unwrap();
        assert!(dir.path().join("docs/outside.md").exists());
    }

    #[test]
    fn structured_rename_is_applied() {
        let (gateway, save_points, dir) = setup(&["src/"]);
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/old.rs"), "fn f() {}\n").unwrap();

        let edits = r#"[{"op": "rename_file", "from": "src/old.rs", "to": "src/new.rs"}]"#;
        let patch = Patch::parse(edits).unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        assert_eq!(
            plan.report.files_renamed,
            vec![(PathBuf::from("src/old.rs"), PathBuf::from("src/new.rs"))]
        );

        engine()
            .apply(&plan, &gateway, &save_points, "phase-1", 0, &[])
            .unwrap();
        assert!(!dir.path().join("src/old.rs").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("src/new.rs")).unwrap(),
            "fn f() {}\n"
        );
    }

    #[test]
    fn net_deletion_saturates_at_zero() {
        let report = ApplyReport {
            lines_added: 10,
            lines_deleted: 4,
            ..Default::default()
        };
        assert_eq!(report.net_deletion(), 0);

        let report = ApplyReport {
            lines_added: 4,
            lines_deleted: 304,
            ..Default::default()
        };
        assert_eq!(report.net_deletion(), 300);
    }

    #[test]
    fn unified_line_counts_flow_into_report() {
        let (gateway, _sp, dir) = setup(&["src/"]);
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "a\nb\nc\n").unwrap();

        let patch = Patch::parse(
            "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,3 +1,2 @@\n a\n-b\n-c\n+d\n",
        )
        .unwrap();
        let plan = engine().plan(&patch, &gateway).unwrap();
        assert_eq!(plan.report.lines_added, 1);
        assert_eq!(plan.report.lines_deleted, 2);
        assert_eq!(plan.report.net_deletion(), 1);
    }
}
