//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the relay's production code:
//! - No sleep() calls: every wait is on I/O, a channel, a timeout or a token
//! - No blocking HTTP clients inside the async runtime
//! - No unwrap()/expect() outside tests
//!
//! The helpers here find production source files and yield their code lines
//! with comments and `#[cfg(test)]` items removed.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Source roots checked by every rule, relative to the workspace root
pub const PRODUCTION_ROOTS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// Files that only exist under `#[cfg(test)]`
const TEST_ONLY_FILES: &[&str] = &["testing.rs"];

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The trimmed line
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root (two levels above this crate)
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Every production `.rs` file under [`PRODUCTION_ROOTS`]
pub fn production_sources() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_ROOTS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            let file = entry.path();
            let is_rust = file.extension().and_then(|s| s.to_str()) == Some("rs");
            let test_only = file
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| TEST_ONLY_FILES.contains(&name));
            if is_rust && !test_only {
                files.push(file.to_path_buf());
            }
        }
    }

    files.sort();
    files
}

/// Code lines of `content` outside `#[cfg(test)]` items, comments stripped
///
/// Yields `(line_number, code)` with 1-based line numbers.
pub fn production_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending_test_attr = false;
    let mut test_depth: Option<i64> = None;

    for (idx, raw) in content.lines().enumerate() {
        let code = strip_comment(raw);
        let trimmed = code.trim();

        if let Some(depth) = test_depth.as_mut() {
            *depth += brace_balance(code);
            if *depth <= 0 {
                test_depth = None;
            }
            continue;
        }

        if trimmed.starts_with("#[cfg(test)]") {
            pending_test_attr = true;
            continue;
        }

        if pending_test_attr {
            if trimmed.is_empty() || trimmed.starts_with("#[") {
                continue;
            }
            pending_test_attr = false;
            let balance = brace_balance(code);
            if balance > 0 {
                test_depth = Some(balance);
            }
            continue;
        }

        if !trimmed.is_empty() {
            lines.push((idx + 1, code.to_string()));
        }
    }

    lines
}

/// Scan every production file, reporting lines matching `is_violation`
pub fn scan(is_violation: impl Fn(&str) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();

    for path in production_sources() {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for (line, code) in production_lines(&content) {
            if is_violation(&code) {
                violations.push(Violation {
                    path: path.clone(),
                    line,
                    text: code.trim().to_string(),
                });
            }
        }
    }

    violations
}

/// Panic with a readable report if `violations` is non-empty
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) of: {rule}\nFix these before merging!",
        violations.len()
    );
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(pos) if !line[..pos].contains('"') => &line[..pos],
        _ => line,
    }
}

fn brace_balance(code: &str) -> i64 {
    code.chars().fold(0, |acc, c| match c {
        '{' => acc + 1,
        '}' => acc - 1,
        _ => acc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_cfg_test_module() {
        let source = "\
fn live() {
    work();
}

#[cfg(test)]
mod tests {
    fn helper() {
        std::thread::sleep(d);
    }
}

fn after() {}
";
        let lines: Vec<usize> = production_lines(source).into_iter().map(|(n, _)| n).collect();
        assert_eq!(lines, vec![1, 2, 3, 12]);
    }

    #[test]
    fn test_skips_cfg_test_declaration_only() {
        let source = "#[cfg(test)]\nmod testing;\n\npub use a::B;\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(4, "pub use a::B;".to_string())]);
    }

    #[test]
    fn test_strips_comments() {
        let lines = production_lines("let x = 1; // sleep(forever)\n/// docs sleep()\n");
        assert_eq!(lines, vec![(1, "let x = 1; ".to_string())]);
    }

    #[test]
    fn test_keeps_urls_in_strings() {
        let lines = production_lines("let u = \"http://x\";\n");
        assert_eq!(lines, vec![(1, "let u = \"http://x\";".to_string())]);
    }

    #[test]
    fn test_production_sources_found() {
        let files = production_sources();
        assert!(files.iter().any(|f| f.ends_with("relay/core/src/lib.rs")));
        assert!(!files.iter().any(|f| f.ends_with("testing.rs")));
    }
}
