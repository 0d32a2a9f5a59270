//! Architectural Enforcement
//!
//! Source scanners shared by the enforcement tests in `tests/`:
//! - No sleep() calls in production code
//! - No blocking I/O inside async functions
//!
//! Scanning is line based. Unit-test modules (`#[cfg(test)] mod ... {`) and
//! test-only files are excluded before any rule runs.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source trees checked by every rule
pub const PRODUCTION_DIRS: &[&str] = &["lanes/core/src", "lanes/daemon/src"];

/// Files that only compile under `cfg(test)`
const TEST_ONLY_FILES: &[&str] = &["test_utils.rs"];

/// A rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.message)
    }
}

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Every production `.rs` file under [`PRODUCTION_DIRS`]
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            let is_rust = path.extension().and_then(|s| s.to_str()) == Some("rs");
            let test_only = path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| TEST_ONLY_FILES.contains(&name));
            if is_rust && !test_only {
                files.push(path.to_path_buf());
            }
        }
    }

    files.sort();
    files
}

/// Lines of `content` that belong to production code
///
/// Returns `(line_number, code)` pairs with comments stripped. Everything from
/// a `#[cfg(test)]` attribute followed by an inline module onwards is dropped.
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, String)> {
    let lines: Vec<&str> = content.lines().collect();
    let mut out = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("#[cfg(test)]") && opens_inline_module(lines.get(idx + 1)) {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        let code = line.split("//").next().unwrap_or(line);
        out.push((idx + 1, code.to_string()));
    }

    out
}

fn opens_inline_module(next: Option<&&str>) -> bool {
    next.is_some_and(|line| {
        let line = line.trim();
        (line.starts_with("mod ") || line.starts_with("pub mod ")) && line.ends_with('{')
    })
}

/// Whether the function enclosing line `idx` (0-based) of `lines` is async
#[must_use]
pub fn in_async_fn(lines: &[(usize, String)], idx: usize) -> bool {
    for (_, code) in lines[..=idx].iter().rev() {
        let code = code.trim();
        if code.contains("async fn ") {
            return true;
        }
        if code.starts_with("fn ") || code.contains(" fn ") {
            return false;
        }
    }
    false
}

/// Read `path` and run `rule` over its production lines
pub fn scan_file(
    path: &Path,
    rule: impl Fn(&[(usize, String)], usize) -> Option<String>,
) -> Vec<Violation> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines = production_lines(&content);

    (0..lines.len())
        .filter_map(|idx| {
            rule(&lines, idx).map(|message| Violation {
                path: path.to_path_buf(),
                line: lines[idx].0,
                message,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_test_module_is_dropped() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}".to_string())]);
    }

    #[test]
    fn test_cfg_test_declaration_is_kept() {
        let source = "#[cfg(test)]\npub mod test_utils;\nfn a() {}\n";
        let lines = production_lines(source);
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_comments_are_stripped() {
        let lines = production_lines("let x = 1; // sleep(5)\n/// docs sleep(5)\n");
        assert_eq!(lines, vec![(1, "let x = 1; ".to_string())]);
    }

    #[test]
    fn test_async_detection() {
        let lines = production_lines(
            "pub async fn run() {\n    work();\n}\nfn load() {\n    read();\n}\n",
        );
        assert!(in_async_fn(&lines, 1));
        assert!(!in_async_fn(&lines, 4));
    }

    #[test]
    fn test_production_files_found() {
        let files = production_files();
        assert!(files.iter().any(|p| p.ends_with("lanes/core/src/routing/router.rs")));
        assert!(!files.iter().any(|p| p.ends_with("test_utils.rs")));
    }
}
