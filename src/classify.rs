//! Failure classification
//!
//! Parses raw test/build output into structured failure records using an
//! ordered table of pattern rules. Each rule is a plain record holding a
//! compiled regex and four extraction functions; priority is the table
//! order, and every match of every rule is collected. Adding support for a
//! new ecosystem means adding one table entry, nothing more.

use std::collections::HashSet;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Mount point of the project inside the sandbox; container paths are
/// normalized back to clone-relative paths so file I/O resolves.
const SANDBOX_MOUNT_PREFIX: &str = "/app/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BugType {
    Linting,
    Syntax,
    Logic,
    TypeError,
    Import,
    Indentation,
}

impl BugType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BugType::Linting => "LINTING",
            BugType::Syntax => "SYNTAX",
            BugType::Logic => "LOGIC",
            BugType::TypeError => "TYPE_ERROR",
            BugType::Import => "IMPORT",
            BugType::Indentation => "INDENTATION",
        }
    }
}

impl std::fmt::Display for BugType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedFailure {
    pub bug_type: BugType,
    pub file: String,
    pub line: u32,
    pub error_message: String,
    /// Human-readable suggestion, rendered verbatim into the judge line.
    pub fix: String,
    /// The raw text the pattern matched.
    pub raw: String,
}

type Extract = fn(&Captures) -> String;

struct FailurePattern {
    bug_type: BugType,
    pattern: Regex,
    extract_file: Extract,
    extract_message: Extract,
    suggest_fix: Extract,
    /// Capture group index holding the line number.
    line_group: usize,
}

fn normalize_file_path(path: &str) -> String {
    path.strip_prefix(SANDBOX_MOUNT_PREFIX)
        .unwrap_or(path)
        .to_string()
}

fn group(c: &Captures, i: usize) -> String {
    c.get(i).map(|m| m.as_str().to_string()).unwrap_or_default()
}

fn build_patterns() -> Vec<FailurePattern> {
    vec![
        // Python: flake8 / pylint linting
        FailurePattern {
            bug_type: BugType::Linting,
            pattern: Regex::new(r"(?m)^(.+?):(\d+):\d+:\s*([EWCF]\d+)\s+(.+)$").expect("pattern"),
            extract_file: |c| normalize_file_path(&group(c, 1)),
            line_group: 2,
            extract_message: |c| format!("{} {}", group(c, 3), group(c, 4)),
            suggest_fix: |c| format!("Fix: resolve linting issue {} — {}", group(c, 3), group(c, 4)),
        },
        // Python: IndentationError / TabError (3.10+ emits caret lines)
        FailurePattern {
            bug_type: BugType::Indentation,
            pattern: Regex::new(
                r#"File "(.+?)", line (\d+)\n(?:.*\n){1,3}(IndentationError|TabError):\s*(.+)"#,
            )
            .expect("pattern"),
            extract_file: |c| normalize_file_path(&group(c, 1)),
            line_group: 2,
            extract_message: |c| format!("{}: {}", group(c, 3), group(c, 4)),
            suggest_fix: |c| format!("Fix: correct indentation at line {}", group(c, 2)),
        },
        // Python: SyntaxError
        FailurePattern {
            bug_type: BugType::Syntax,
            pattern: Regex::new(r#"File "(.+?)", line (\d+)\n(?:.*\n){1,3}SyntaxError:\s*(.+)"#)
                .expect("pattern"),
            extract_file: |c| normalize_file_path(&group(c, 1)),
            line_group: 2,
            extract_message: |c| format!("SyntaxError: {}", group(c, 3)),
            suggest_fix: |c| format!("Fix: correct syntax error — {}", group(c, 3)),
        },
        // Python: ImportError / ModuleNotFoundError
        FailurePattern {
            bug_type: BugType::Import,
            pattern: Regex::new(
                r#"File "(.+?)", line (\d+).*\n(?:.*\n){0,4}(ImportError|ModuleNotFoundError):\s*(.+)"#,
            )
            .expect("pattern"),
            extract_file: |c| normalize_file_path(&group(c, 1)),
            line_group: 2,
            extract_message: |c| format!("{}: {}", group(c, 3), group(c, 4)),
            suggest_fix: |c| {
                let verb = if group(c, 4).contains("cannot import") {
                    "remove"
                } else {
                    "add"
                };
                format!("Fix: {} the import statement", verb)
            },
        },
        // Python: NameError / AttributeError
        FailurePattern {
            bug_type: BugType::Logic,
            pattern: Regex::new(
                r#"File "(.+?)", line (\d+).*\n(?:.*\n){0,4}(NameError|AttributeError):\s*(.+)"#,
            )
            .expect("pattern"),
            extract_file: |c| normalize_file_path(&group(c, 1)),
            line_group: 2,
            extract_message: |c| format!("{}: {}", group(c, 3), group(c, 4)),
            suggest_fix: |c| format!("Fix: resolve {} — {}", group(c, 3), group(c, 4)),
        },
        // Python: TypeError
        FailurePattern {
            bug_type: BugType::TypeError,
            pattern: Regex::new(r#"File "(.+?)", line (\d+).*\n(?:.*\n){0,4}TypeError:\s*(.+)"#)
                .expect("pattern"),
            extract_file: |c| normalize_file_path(&group(c, 1)),
            line_group: 2,
            extract_message: |c| format!("TypeError: {}", group(c, 3)),
            suggest_fix: |c| format!("Fix: resolve type error — {}", group(c, 3)),
        },
        // Python: AssertionError in tests
        FailurePattern {
            bug_type: BugType::Logic,
            pattern: Regex::new(r#"File "(.+?)", line (\d+).*\n(?:.*\n){0,4}AssertionError:\s*(.+)"#)
                .expect("pattern"),
            extract_file: |c| normalize_file_path(&group(c, 1)),
            line_group: 2,
            extract_message: |c| format!("AssertionError: {}", group(c, 3)),
            suggest_fix: |_| "Fix: correct logic producing wrong assertion result".to_string(),
        },
        // TypeScript: tsc: src/file.ts(10,5): error TS2345: ...
        FailurePattern {
            bug_type: BugType::TypeError,
            pattern: Regex::new(r"(.+?)\((\d+),\d+\):\s*error\s+(TS\d+):\s*(.+)").expect("pattern"),
            extract_file: |c| group(c, 1),
            line_group: 2,
            extract_message: |c| format!("{}: {}", group(c, 3), group(c, 4)),
            suggest_fix: |c| {
                format!("Fix: resolve TypeScript error {} — {}", group(c, 3), group(c, 4))
            },
        },
        // TypeScript: tsc: src/file.ts:10:5 - error TS2345: ...
        FailurePattern {
            bug_type: BugType::TypeError,
            pattern: Regex::new(r"(.+?):(\d+):\d+\s*-\s*error\s+(TS\d+):\s*(.+)").expect("pattern"),
            extract_file: |c| group(c, 1),
            line_group: 2,
            extract_message: |c| format!("{}: {}", group(c, 3), group(c, 4)),
            suggest_fix: |c| {
                format!("Fix: resolve TypeScript error {} — {}", group(c, 3), group(c, 4))
            },
        },
        // ESLint: src/file.ts:10:5 error rule message
        FailurePattern {
            bug_type: BugType::Linting,
            pattern: Regex::new(r"(.+?):(\d+):\d+\s+error\s+(.+?)\s{2,}(.+)").expect("pattern"),
            extract_file: |c| group(c, 1),
            line_group: 2,
            extract_message: |c| format!("{}: {}", group(c, 4), group(c, 3)),
            suggest_fix: |c| format!("Fix: resolve ESLint error {}", group(c, 4)),
        },
        // Node: SyntaxError with file context
        FailurePattern {
            bug_type: BugType::Syntax,
            pattern: Regex::new(r"(.+?):(\d+)\n.*\nSyntaxError:\s*(.+)").expect("pattern"),
            extract_file: |c| group(c, 1),
            line_group: 2,
            extract_message: |c| format!("SyntaxError: {}", group(c, 3)),
            suggest_fix: |c| format!("Fix: correct syntax error — {}", group(c, 3)),
        },
        // Node: Cannot find module
        FailurePattern {
            bug_type: BugType::Import,
            pattern: Regex::new(
                r"Error:\s*Cannot find module '(.+?)'\n.*\n\s+at.*\((.+?):(\d+):\d+\)",
            )
            .expect("pattern"),
            extract_file: |c| group(c, 2),
            line_group: 3,
            extract_message: |c| format!("Cannot find module '{}'", group(c, 1)),
            suggest_fix: |c| format!("Fix: install or correct the import for '{}'", group(c, 1)),
        },
        // Generic: file:line: error message fallback
        FailurePattern {
            bug_type: BugType::Syntax,
            pattern: Regex::new(r"(.+?):(\d+)(?::\d+)?:\s*(?:error|Error):\s*(.+)").expect("pattern"),
            extract_file: |c| group(c, 1),
            line_group: 2,
            extract_message: |c| group(c, 3),
            suggest_fix: |c| format!("Fix: resolve error — {}", group(c, 3)),
        },
    ]
}

pub struct FailureClassifier {
    patterns: Vec<FailurePattern>,
}

impl FailureClassifier {
    pub fn new() -> Self {
        Self {
            patterns: build_patterns(),
        }
    }

    /// Classify raw test output into structured failures.
    ///
    /// Patterns run in priority order and every match is collected;
    /// duplicates on (bug_type, file, line) keep whichever pattern fired
    /// first. Deterministic for identical input.
    pub fn classify(&self, raw_output: &str) -> Vec<ClassifiedFailure> {
        let mut failures = Vec::new();
        let mut seen: HashSet<(BugType, String, u32)> = HashSet::new();

        for entry in &self.patterns {
            for captures in entry.pattern.captures_iter(raw_output) {
                let file = (entry.extract_file)(&captures);
                let line: u32 = captures
                    .get(entry.line_group)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0);

                if !seen.insert((entry.bug_type, file.clone(), line)) {
                    continue;
                }

                failures.push(ClassifiedFailure {
                    bug_type: entry.bug_type,
                    file,
                    line,
                    error_message: (entry.extract_message)(&captures),
                    fix: (entry.suggest_fix)(&captures),
                    raw: captures
                        .get(0)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                });
            }
        }

        info!("Classified {} failure(s)", failures.len());
        failures
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}
