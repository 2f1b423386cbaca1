//! Top-level symbol extraction and structural skeleton comparison.
//!
//! Language-light heuristics: a symbol is a named top-level
//! declaration (function, class, struct, exported binding) matched at
//! column zero. The structural skeleton of a file is its symbol set
//! plus its import set; the skeleton overlap ratio feeds the
//! structural-drift check.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

fn symbol_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Rust
            r"^(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)",
            r"^(?:pub(?:\([^)]*\))?\s+)?struct\s+([A-Za-z_][A-Za-z0-9_]*)",
            r"^(?:pub(?:\([^)]*\))?\s+)?enum\s+([A-Za-z_][A-Za-z0-9_]*)",
            r"^(?:pub(?:\([^)]*\))?\s+)?trait\s+([A-Za-z_][A-Za-z0-9_]*)",
            // Python
            r"^(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)",
            r"^class\s+([A-Za-z_][A-Za-z0-9_]*)",
            // JavaScript / TypeScript
            r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s+([A-Za-z_$][A-Za-z0-9_$]*)",
            r"^(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*=",
            r"^(?:export\s+)?interface\s+([A-Za-z_$][A-Za-z0-9_$]*)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static symbol pattern"))
        .collect()
    })
}

fn import_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(use\s+|import\s+|from\s+\S+\s+import\s+|#include\s+|require\s*\()")
            .expect("static import pattern")
    })
}

/// Named top-level symbols declared in the file.
pub fn extract_symbols(contents: &str) -> BTreeSet<String> {
    let mut symbols = BTreeSet::new();
    for line in contents.lines() {
        for pattern in symbol_patterns() {
            if let Some(caps) = pattern.captures(line) {
                if let Some(name) = caps.get(1) {
                    symbols.insert(name.as_str().to_string());
                }
                break;
            }
        }
    }
    symbols
}

/// Import lines, trimmed, as the second half of the skeleton.
pub fn extract_imports(contents: &str) -> BTreeSet<String> {
    contents
        .lines()
        .filter(|line| import_pattern().is_match(line))
        .map(|line| line.trim_end().to_string())
        .collect()
}

/// Structural skeleton of a file: top-level symbols plus imports.
#[derive(Debug, Clone, PartialEq)]
pub struct Skeleton {
    pub symbols: BTreeSet<String>,
    pub imports: BTreeSet<String>,
}

impl Skeleton {
    pub fn of(contents: &str) -> Self {
        Self {
            symbols: extract_symbols(contents),
            imports: extract_imports(contents),
        }
    }

    fn size(&self) -> usize {
        self.symbols.len() + self.imports.len()
    }

    /// Fraction of this skeleton's elements preserved in `other`.
    /// An empty original skeleton trivially overlaps.
    pub fn overlap_with(&self, other: &Skeleton) -> f64 {
        let total = self.size();
        if total == 0 {
            return 1.0;
        }
        let kept = self.symbols.intersection(&other.symbols).count()
            + self.imports.intersection(&other.imports).count();
        kept as f64 / total as f64
    }

    /// Symbols present here but absent from `other`.
    pub fn missing_from<'a>(&'a self, other: &'a Skeleton) -> Vec<&'a str> {
        self.symbols
            .difference(&other.symbols)
            .map(|s| s.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rust_symbols() {
        let src = "\
pub fn alpha() {}
fn beta() {}
pub(crate) struct Gamma;
enum Delta { A }
pub trait Epsilon {}
    fn indented_is_not_top_level() {}
";
        let symbols = extract_symbols(src);
        assert!(symbols.contains("alpha"));
        assert!(symbols.contains("beta"));
        assert!(symbols.contains("Gamma"));
        assert!(symbols.contains("Delta"));
        assert!(symbols.contains("Epsilon"));
        assert!(!symbols.contains("indented_is_not_top_level"));
    }

    #[test]
    fn extracts_python_symbols() {
        let src = "def greet():\n    pass\n\nclass Widget:\n    def method(self): pass\n";
        let symbols = extract_symbols(src);
        assert!(symbols.contains("greet"));
        assert!(symbols.contains("Widget"));
        assert!(!symbols.contains("method"));
    }

    #[test]
    fn extracts_js_symbols() {
        let src = "export function run() {}\nexport const handler = () => {};\nconst local = 1;\n";
        let symbols = extract_symbols(src);
        assert!(symbols.contains("run"));
        assert!(symbols.contains("handler"));
        assert!(symbols.contains("local"));
    }

    #[test]
    fn extracts_imports() {
        let src = "use std::fs;\nimport os\nfrom typing import Any\nfn body() {}\n";
        let imports = extract_imports(src);
        assert_eq!(imports.len(), 3);
        assert!(imports.contains("use std::fs;"));
    }

    #[test]
    fn overlap_full_when_unchanged() {
        let src = "use a;\nfn one() {}\nfn two() {}\n";
        let skel = Skeleton::of(src);
        assert_eq!(skel.overlap_with(&Skeleton::of(src)), 1.0);
    }

    #[test]
    fn overlap_drops_when_symbols_removed() {
        let old = Skeleton::of("fn one() {}\nfn two() {}\nfn three() {}\nfn four() {}\n");
        let new = Skeleton::of("fn one() {}\n");
        assert_eq!(old.overlap_with(&new), 0.25);
    }

    #[test]
    fn overlap_of_empty_original_is_one() {
        let old = Skeleton::of("// just a comment\n");
        let new = Skeleton::of("fn anything() {}\n");
        assert_eq!(old.overlap_with(&new), 1.0);
    }

    #[test]
    fn missing_from_reports_deleted_symbols() {
        let old = Skeleton::of("fn keep() {}\nfn gone() {}\n");
        let new = Skeleton::of("fn keep() {}\n");
        assert_eq!(old.missing_from(&new), vec!["gone"]);
    }

    #[test]
    fn renamed_symbol_counts_as_missing() {
        let old = Skeleton::of("fn old_name() {}\n");
        let new = Skeleton::of("fn new_name() {}\n");
        assert_eq!(old.missing_from(&new), vec!["old_name"]);
    }
}
