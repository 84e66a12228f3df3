//! Judge-format rendering
//!
//! Renders a classified failure to the EXACT line an external grading
//! collaborator consumes. No variation allowed:
//!
//!   <BUG_TYPE> error in <file> line <line> → Fix: <human readable fix>
//!
//! Example:
//!   LINTING error in src/utils.py line 15 → Fix: remove the import statement

use crate::classify::ClassifiedFailure;

pub fn format_failure_for_judge(failure: &ClassifiedFailure) -> String {
    format!(
        "{} error in {} line {} \u{2192} {}",
        failure.bug_type,
        failure.file,
        failure.line,
        normalize_fix_description(&failure.fix)
    )
}

pub fn format_all_failures_for_judge(failures: &[ClassifiedFailure]) -> Vec<String> {
    failures.iter().map(format_failure_for_judge).collect()
}

/// Ensure the description starts with exactly one `"Fix: "` prefix and has
/// internal whitespace collapsed to single spaces. Idempotent: normalizing
/// an already-normalized string returns it unchanged.
pub fn normalize_fix_description(raw: &str) -> String {
    let trimmed = raw.trim();

    let with_prefix = match strip_fix_prefix(trimmed) {
        Some(rest) => format!("Fix:{}", rest),
        None => format!("Fix: {}", trimmed),
    };

    with_prefix.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-insensitive match of a leading `fix:`; returns the remainder.
fn strip_fix_prefix(s: &str) -> Option<&str> {
    match s.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("fix:") => Some(&s[4..]),
        _ => None,
    }
}
