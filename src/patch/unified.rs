//! Unified-diff parsing and in-memory application.
//!
//! The parser accepts the traditional `--- a/path` / `+++ b/path`
//! header pair followed by `@@` hunks. File creation and deletion are
//! expressed with `/dev/null` on the corresponding side. Application
//! is strict: each hunk must match its context at the declared
//! position, with a whole-file unique-match fallback to tolerate
//! drifted line numbers.

use std::path::PathBuf;

use crate::errors::PatchError;

/// One parsed file section of a unified diff.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePatch {
    /// Source path, `None` for a created file
    pub old_path: Option<PathBuf>,
    /// Destination path, `None` for a deleted file
    pub new_path: Option<PathBuf>,
    pub hunks: Vec<Hunk>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    /// 1-based start line in the old file
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HunkLine {
    Context(String),
    Added(String),
    Removed(String),
}

impl FilePatch {
    /// The path this patch targets (destination, or source for a
    /// deletion).
    pub fn target(&self) -> &PathBuf {
        self.new_path
            .as_ref()
            .or(self.old_path.as_ref())
            .expect("file patch with neither side")
    }

    pub fn is_create(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_delete(&self) -> bool {
        self.new_path.is_none()
    }

    pub fn lines_added(&self) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| &h.lines)
            .filter(|l| matches!(l, HunkLine::Added(_)))
            .count()
    }

    pub fn lines_removed(&self) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| &h.lines)
            .filter(|l| matches!(l, HunkLine::Removed(_)))
            .count()
    }
}

fn parse_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    // Strip a trailing timestamp some producers append after a tab.
    let raw = raw.split('\t').next().unwrap_or(raw);
    if raw == "/dev/null" {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(PathBuf::from(stripped))
}

fn parse_range(raw: &str) -> Result<(usize, usize), PatchError> {
    // "12,3" or "12" (count defaults to 1)
    let mut parts = raw.splitn(2, ',');
    let start = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PatchError::Parse(format!("invalid hunk range: {}", raw)))?;
    let count = match parts.next() {
        Some(c) => c
            .parse()
            .map_err(|_| PatchError::Parse(format!("invalid hunk range: {}", raw)))?,
        None => 1,
    };
    Ok((start, count))
}

fn parse_hunk_header(line: &str) -> Result<(usize, usize, usize, usize), PatchError> {
    // "@@ -old_start,old_count +new_start,new_count @@ ..."
    let inner = line
        .strip_prefix("@@")
        .and_then(|rest| rest.find("@@").map(|idx| &rest[..idx]))
        .ok_or_else(|| PatchError::Parse(format!("malformed hunk header: {}", line)))?;
    let mut old = None;
    let mut new = None;
    for token in inner.split_whitespace() {
        if let Some(range) = token.strip_prefix('-') {
            old = Some(parse_range(range)?);
        } else if let Some(range) = token.strip_prefix('+') {
            new = Some(parse_range(range)?);
        }
    }
    match (old, new) {
        (Some((os, oc)), Some((ns, nc))) => Ok((os, oc, ns, nc)),
        _ => Err(PatchError::Parse(format!(
            "hunk header missing ranges: {}",
            line
        ))),
    }
}

/// Parse a unified diff, possibly spanning multiple files.
pub fn parse(text: &str) -> Result<Vec<FilePatch>, PatchError> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut current: Option<FilePatch> = None;
    let mut pending_old: Option<Option<PathBuf>> = None;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            if let Some(fp) = current.take() {
                patches.push(fp);
            }
            pending_old = Some(parse_path(rest));
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let old_path = pending_old.take().ok_or_else(|| {
                PatchError::Parse("'+++' header without preceding '---'".into())
            })?;
            let new_path = parse_path(rest);
            if old_path.is_none() && new_path.is_none() {
                return Err(PatchError::Parse(
                    "patch with /dev/null on both sides".into(),
                ));
            }
            current = Some(FilePatch {
                old_path,
                new_path,
                hunks: Vec::new(),
            });
        } else if line.starts_with("@@") {
            let fp = current.as_mut().ok_or_else(|| {
                PatchError::Parse("hunk header before file headers".into())
            })?;
            let (old_start, old_count, new_start, new_count) = parse_hunk_header(line)?;
            fp.hunks.push(Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: Vec::new(),
            });
        } else if let Some(fp) = current.as_mut() {
            let Some(hunk) = fp.hunks.last_mut() else {
                // Text between headers and the first hunk (e.g. "index"
                // lines) is ignored.
                continue;
            };
            if let Some(content) = line.strip_prefix('+') {
                hunk.lines.push(HunkLine::Added(content.to_string()));
            } else if let Some(content) = line.strip_prefix('-') {
                hunk.lines.push(HunkLine::Removed(content.to_string()));
            } else if let Some(content) = line.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(content.to_string()));
            } else if line == "\\ No newline at end of file" || line.is_empty() {
                // Tolerated; empty context lines arrive stripped of the
                // leading space from some producers.
                if !line.is_empty() {
                    continue;
                }
                hunk.lines.push(HunkLine::Context(String::new()));
            } else {
                return Err(PatchError::Parse(format!(
                    "unexpected line in hunk: {}",
                    line
                )));
            }
        }
        // Lines before the first '---' header (commit messages, "diff
        // --git" lines) are skipped.
    }

    if let Some(fp) = current.take() {
        patches.push(fp);
    }
    if pending_old.is_some() {
        return Err(PatchError::Parse("'---' header without '+++'".into()));
    }
    if patches.is_empty() {
        return Err(PatchError::Parse("no file patches found".into()));
    }
    for fp in &patches {
        if fp.hunks.is_empty() && !fp.is_create() && !fp.is_delete() {
            return Err(PatchError::Parse(format!(
                "patch for {} has no hunks",
                fp.target().display()
            )));
        }
    }
    Ok(patches)
}

/// The old-side line sequence a hunk expects (context + removed).
fn expected_lines(hunk: &Hunk) -> Vec<&str> {
    hunk.lines
        .iter()
        .filter_map(|l| match l {
            HunkLine::Context(s) | HunkLine::Removed(s) => Some(s.as_str()),
            HunkLine::Added(_) => None,
        })
        .collect()
}

fn matches_at(lines: &[&str], at: usize, expected: &[&str]) -> bool {
    if at + expected.len() > lines.len() {
        return false;
    }
    expected.iter().enumerate().all(|(i, e)| lines[at + i] == *e)
}

/// Apply a single-file patch to the current contents. `None` contents
/// mean the file does not exist.
pub fn apply(fp: &FilePatch, contents: Option<&str>) -> Result<Option<String>, PatchError> {
    let target = fp.target().clone();

    if fp.is_create() {
        if contents.is_some() {
            return Err(PatchError::ApplyConflict {
                path: target,
                reason: "patch creates a file that already exists".into(),
            });
        }
        let mut out = String::new();
        for line in fp.hunks.iter().flat_map(|h| &h.lines) {
            match line {
                HunkLine::Added(s) => {
                    out.push_str(s);
                    out.push('\n');
                }
                HunkLine::Context(_) | HunkLine::Removed(_) => {
                    return Err(PatchError::ApplyConflict {
                        path: target,
                        reason: "creation patch contains non-added lines".into(),
                    })
                }
            }
        }
        return Ok(Some(out));
    }

    let Some(contents) = contents else {
        return Err(PatchError::ApplyConflict {
            path: target,
            reason: "patch modifies a file that does not exist".into(),
        });
    };

    if fp.is_delete() {
        return Ok(None);
    }

    let old_lines: Vec<&str> = contents.lines().collect();
    let mut result: Vec<String> = Vec::with_capacity(old_lines.len());
    let mut cursor = 0usize; // index into old_lines

    for hunk in &fp.hunks {
        let expected = expected_lines(hunk);
        let declared = hunk.old_start.saturating_sub(1);

        let position = if matches_at(&old_lines, declared, &expected) {
            declared
        } else {
            // Fall back to a unique whole-file match.
            let candidates: Vec<usize> = (0..=old_lines.len().saturating_sub(expected.len()))
                .filter(|&i| matches_at(&old_lines, i, &expected))
                .collect();
            match candidates.as_slice() {
                [only] if *only >= cursor => *only,
                [] => {
                    return Err(PatchError::ApplyConflict {
                        path: target,
                        reason: format!("hunk context not found near line {}", hunk.old_start),
                    })
                }
                _ => {
                    return Err(PatchError::ApplyConflict {
                        path: target,
                        reason: format!("ambiguous hunk context near line {}", hunk.old_start),
                    })
                }
            }
        };

        if position < cursor {
            return Err(PatchError::ApplyConflict {
                path: target,
                reason: "hunks overlap or are out of order".into(),
            });
        }

        for line in &old_lines[cursor..position] {
            result.push((*line).to_string());
        }

        let mut old_idx = position;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(s) => {
                    result.push(s.clone());
                    old_idx += 1;
                }
                HunkLine::Removed(_) => {
                    old_idx += 1;
                }
                HunkLine::Added(s) => {
                    result.push(s.clone());
                }
            }
        }
        cursor = old_idx;
    }

    for line in &old_lines[cursor..] {
        result.push((*line).to_string());
    }

    let mut out = result.join("\n");
    if contents.ends_with('\n') || contents.is_empty() {
        out.push('\n');
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODIFY: &str = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,3 @@
 fn one() {}
-fn two() {}
+fn two() { todo!() }
 fn three() {}
";

    #[test]
    fn parses_single_file_modify() {
        let patches = parse(MODIFY).unwrap();
        assert_eq!(patches.len(), 1);
        let fp = &patches[0];
        assert_eq!(fp.target(), &PathBuf::from("src/lib.rs"));
        assert!(!fp.is_create());
        assert!(!fp.is_delete());
        assert_eq!(fp.hunks.len(), 1);
        assert_eq!(fp.lines_added(), 1);
        assert_eq!(fp.lines_removed(), 1);
    }

    #[test]
    fn applies_modify() {
        let patches = parse(MODIFY).unwrap();
        let original = "fn one() {}\nfn two() {}\nfn three() {}\n";
        let out = apply(&patches[0], Some(original)).unwrap().unwrap();
        assert_eq!(out, "fn one() {}\nfn two() { todo!() }\nfn three() {}\n");
    }

    #[test]
    fn applies_with_drifted_line_numbers() {
        let patches = parse(MODIFY).unwrap();
        // Two extra lines on top shift the hunk; unique context match
        // recovers it.
        let original = "// header\n// header 2\nfn one() {}\nfn two() {}\nfn three() {}\n";
        let out = apply(&patches[0], Some(original)).unwrap().unwrap();
        assert!(out.contains("fn two() { todo!() }"));
        assert!(out.starts_with("// header\n"));
    }

    #[test]
    fn create_via_dev_null() {
        let text = "\
--- /dev/null
+++ b/src/new.rs
@@ -0,0 +1,2 @@
+fn created() {}
+fn another() {}
";
        let patches = parse(text).unwrap();
        assert!(patches[0].is_create());
        let out = apply(&patches[0], None).unwrap().unwrap();
        assert_eq!(out, "fn created() {}\nfn another() {}\n");
    }

    #[test]
    fn create_conflicts_if_file_exists() {
        let text = "\
--- /dev/null
+++ b/src/new.rs
@@ -0,0 +1,1 @@
+fn created() {}
";
        let patches = parse(text).unwrap();
        let err = apply(&patches[0], Some("existing")).unwrap_err();
        assert!(matches!(err, PatchError::ApplyConflict { .. }));
    }

    #[test]
    fn delete_via_dev_null() {
        let text = "\
--- a/src/old.rs
+++ /dev/null
@@ -1,1 +0,0 @@
-fn gone() {}
";
        let patches = parse(text).unwrap();
        assert!(patches[0].is_delete());
        assert_eq!(apply(&patches[0], Some("fn gone() {}\n")).unwrap(), None);
    }

    #[test]
    fn multi_file_patch() {
        let text = "\
--- a/one.rs
+++ b/one.rs
@@ -1,1 +1,1 @@
-a
+b
--- a/two.rs
+++ b/two.rs
@@ -1,1 +1,1 @@
-c
+d
";
        let patches = parse(text).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].target(), &PathBuf::from("one.rs"));
        assert_eq!(patches[1].target(), &PathBuf::from("two.rs"));
    }

    #[test]
    fn context_mismatch_is_conflict() {
        let patches = parse(MODIFY).unwrap();
        let err = apply(&patches[0], Some("completely\ndifferent\nfile\n")).unwrap_err();
        match err {
            PatchError::ApplyConflict { path, .. } => {
                assert_eq!(path, PathBuf::from("src/lib.rs"));
            }
            other => panic!("expected ApplyConflict, got {:?}", other),
        }
    }

    #[test]
    fn modifying_missing_file_is_conflict() {
        let patches = parse(MODIFY).unwrap();
        assert!(matches!(
            apply(&patches[0], None),
            Err(PatchError::ApplyConflict { .. })
        ));
    }

    #[test]
    fn malformed_input_is_parse_error() {
        assert!(matches!(parse("not a diff"), Err(PatchError::Parse(_))));
        assert!(matches!(parse(""), Err(PatchError::Parse(_))));

        let missing_plus = "--- a/x.rs\n@@ -1,1 +1,1 @@\n-a\n+b\n";
        assert!(matches!(parse(missing_plus), Err(PatchError::Parse(_))));
    }

    #[test]
    fn garbage_inside_hunk_is_parse_error() {
        let text = "\
--- a/x.rs
+++ b/x.rs
@@ -1,1 +1,1 @@
-a
+b
!garbage
";
        assert!(matches!(parse(text), Err(PatchError::Parse(_))));
    }

    #[test]
    fn leading_noise_is_skipped() {
        let text = format!("diff --git a/src/lib.rs b/src/lib.rs\nindex 123..456 100644\n{}", MODIFY);
        let patches = parse(&text).unwrap();
        assert_eq!(patches.len(), 1);
    }

    #[test]
    fn hunk_without_ranges_is_parse_error() {
        let text = "--- a/x.rs\n+++ b/x.rs\n@@ garbage @@\n";
        assert!(matches!(parse(text), Err(PatchError::Parse(_))));
    }

    #[test]
    fn two_hunks_apply_in_order() {
        let text = "\
--- a/x.rs
+++ b/x.rs
@@ -1,2 +1,2 @@
 line1
-line2
+LINE2
@@ -4,2 +4,2 @@
 line4
-line5
+LINE5
";
        let patches = parse(text).unwrap();
        let original = "line1\nline2\nline3\nline4\nline5\n";
        let out = apply(&patches[0], Some(original)).unwrap().unwrap();
        assert_eq!(out, "line1\nLINE2\nline3\nline4\nLINE5\n");
    }
}
