//! CI failure diagnosis and remediation
//!
//! Categorizes a failed workflow run from its job logs with an ordered
//! regex table (first match wins), then applies the matching remediation:
//! transient categories get the workflow re-run, everything else gets a
//! labeled issue for human review.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use tracing::info;

use crate::github::{GitHubClient, WorkflowRun};
use crate::util::{truncate, with_retry};

const MAX_RAW_LOG_CHARS: usize = 5_000;
const SUMMARY_EXCERPT_CHARS: usize = 500;
const ISSUE_EXCERPT_CHARS: usize = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    BuildError,
    TestFailure,
    DependencyIssue,
    ConfigurationError,
    InfrastructureError,
    Timeout,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildError => "BUILD_ERROR",
            Self::TestFailure => "TEST_FAILURE",
            Self::DependencyIssue => "DEPENDENCY_ISSUE",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::InfrastructureError => "INFRASTRUCTURE_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Transient categories are worth a blind re-run before involving a
    /// human.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DependencyIssue | Self::Timeout | Self::InfrastructureError
        )
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub run_id: u64,
    pub category: FailureCategory,
    pub summary: String,
    pub suggested_fix: String,
    pub raw_logs: String,
}

#[derive(Debug, Serialize)]
pub struct HealOutcome {
    pub success: bool,
    pub run_id: u64,
    pub category: FailureCategory,
    pub actions: Vec<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Ordered: earlier patterns win, so dependency noise is not misread as a
/// build error further down.
fn failure_patterns() -> &'static Vec<(Regex, FailureCategory)> {
    static PATTERNS: OnceLock<Vec<(Regex, FailureCategory)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)npm ERR!|yarn error|pnpm ERR", FailureCategory::DependencyIssue),
            (
                r"(?i)ENOENT|MODULE_NOT_FOUND|Cannot find module",
                FailureCategory::DependencyIssue,
            ),
            (
                r"(?i)tsc.*error TS|SyntaxError|compilation failed",
                FailureCategory::BuildError,
            ),
            (r"(?i)build failed|Build error", FailureCategory::BuildError),
            (
                r"(?i)FAIL.*test|test.*failed|AssertionError|expect\(",
                FailureCategory::TestFailure,
            ),
            (r"(?i)jest.*failed|mocha.*failing", FailureCategory::TestFailure),
            (
                r"(?i)ENOMEM|disk space|quota exceeded",
                FailureCategory::InfrastructureError,
            ),
            (r"(?i)timeout|timed out|ETIMEDOUT", FailureCategory::Timeout),
            (
                r"(?i)invalid.*config|missing.*env|environment variable",
                FailureCategory::ConfigurationError,
            ),
        ]
        .iter()
        .map(|(p, c)| (Regex::new(p).expect("failure pattern"), *c))
        .collect()
    })
}

pub fn categorize_failure(logs: &str) -> FailureCategory {
    for (pattern, category) in failure_patterns() {
        if pattern.is_match(logs) {
            return *category;
        }
    }
    FailureCategory::Unknown
}

fn suggested_fix(category: FailureCategory) -> &'static str {
    match category {
        FailureCategory::BuildError => {
            "Review compiler/build errors in the logs. Check for syntax errors or missing type definitions."
        }
        FailureCategory::TestFailure => {
            "Review failing test assertions. Check if test fixtures or mocks need updating."
        }
        FailureCategory::DependencyIssue => {
            "Clear dependency caches and lock file, then reinstall. Check for conflicting peer dependencies."
        }
        FailureCategory::ConfigurationError => {
            "Verify environment variables and configuration files are set correctly."
        }
        FailureCategory::InfrastructureError => {
            "Infrastructure issue detected. Re-run the workflow or check runner health."
        }
        FailureCategory::Timeout => {
            "Workflow timed out. Consider increasing timeout limits or optimizing long-running steps."
        }
        FailureCategory::Unknown => "Unable to auto-diagnose. Manual investigation required.",
    }
}

fn build_summary(run: &WorkflowRun, category: FailureCategory, logs: &str) -> String {
    [
        format!("Workflow: {}", run.name.as_deref().unwrap_or("unknown")),
        format!("Run ID: {}", run.id),
        format!("Category: {}", category),
        format!("Created: {}", run.created_at),
        format!("Log excerpt: {}", truncate(logs, SUMMARY_EXCERPT_CHARS)),
    ]
    .join("\n")
}

fn format_issue_body(diagnosis: &Diagnosis) -> String {
    [
        "## Automated failure report".to_string(),
        String::new(),
        format!("**Run ID:** {}", diagnosis.run_id),
        format!("**Category:** {}", diagnosis.category),
        format!("**Suggested Fix:** {}", diagnosis.suggested_fix),
        String::new(),
        "### Summary".to_string(),
        diagnosis.summary.clone(),
        String::new(),
        "### Log Excerpt".to_string(),
        "```".to_string(),
        truncate(&diagnosis.raw_logs, ISSUE_EXCERPT_CHARS),
        "```".to_string(),
        String::new(),
        "_This issue was created automatically by mender._".to_string(),
    ]
    .join("\n")
}

pub struct HealingAgent<'a> {
    github: &'a GitHubClient,
    retry_limit: u32,
}

impl<'a> HealingAgent<'a> {
    pub fn new(github: &'a GitHubClient, retry_limit: u32) -> Self {
        Self {
            github,
            retry_limit,
        }
    }

    /// Fetch the run's job logs and categorize the failure.
    pub async fn diagnose(&self, run: &WorkflowRun) -> Result<Diagnosis> {
        info!(
            "Diagnosing failure for run {} ({:?})",
            run.id,
            run.name.as_deref().unwrap_or("unknown")
        );

        let logs = self.github.workflow_logs(run.id).await?;
        let category = categorize_failure(&logs);

        let diagnosis = Diagnosis {
            run_id: run.id,
            category,
            summary: build_summary(run, category, &logs),
            suggested_fix: suggested_fix(category).to_string(),
            raw_logs: truncate(&logs, MAX_RAW_LOG_CHARS),
        };

        info!("Diagnosis complete: {} (run {})", category, run.id);
        Ok(diagnosis)
    }

    /// Apply the remediation for a diagnosis, retrying with backoff.
    pub async fn heal(&self, diagnosis: &Diagnosis) -> HealOutcome {
        info!(
            "Attempting to heal run {} ({})",
            diagnosis.run_id, diagnosis.category
        );

        let attempts = AtomicU32::new(0);
        let label = format!("heal-run-{}", diagnosis.run_id);
        let result = with_retry(&label, self.retry_limit, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            self.apply_fix(diagnosis)
        })
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(actions) => HealOutcome {
                success: true,
                run_id: diagnosis.run_id,
                category: diagnosis.category,
                actions,
                attempts,
                error: None,
            },
            Err(err) => HealOutcome {
                success: false,
                run_id: diagnosis.run_id,
                category: diagnosis.category,
                actions: Vec::new(),
                attempts,
                error: Some(err.to_string()),
            },
        }
    }

    async fn apply_fix(&self, diagnosis: &Diagnosis) -> Result<Vec<String>> {
        let mut actions = Vec::new();

        if diagnosis.category.is_transient() {
            actions.push(format!(
                "Identified {}: re-running workflow",
                diagnosis.category
            ));
            self.github.rerun_workflow(diagnosis.run_id).await?;
            actions.push(format!("Re-triggered workflow run {}", diagnosis.run_id));
            return Ok(actions);
        }

        let title = match diagnosis.category {
            FailureCategory::BuildError => {
                format!("[mender] Build failure in run #{}", diagnosis.run_id)
            }
            FailureCategory::TestFailure => {
                format!("[mender] Test failure in run #{}", diagnosis.run_id)
            }
            FailureCategory::ConfigurationError => {
                format!("[mender] Configuration error in run #{}", diagnosis.run_id)
            }
            _ => format!("[mender] Undiagnosed failure in run #{}", diagnosis.run_id),
        };

        actions.push(format!("Identified {} from CI logs", diagnosis.category));
        let issue_url = self
            .github
            .create_issue(&title, &format_issue_body(diagnosis))
            .await?;
        actions.push(format!("Created issue {}", issue_url));
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_each_category() {
        assert_eq!(
            categorize_failure("npm ERR! peer dep conflict"),
            FailureCategory::DependencyIssue
        );
        assert_eq!(
            categorize_failure("Error: Cannot find module 'express'"),
            FailureCategory::DependencyIssue
        );
        assert_eq!(
            categorize_failure("src/app.ts(3,1): error TS2304 via tsc build"),
            FailureCategory::BuildError
        );
        assert_eq!(
            categorize_failure("AssertionError: expected 1 to equal 2"),
            FailureCategory::TestFailure
        );
        assert_eq!(
            categorize_failure("fatal: ENOMEM during step"),
            FailureCategory::InfrastructureError
        );
        assert_eq!(
            categorize_failure("step timed out after 360s"),
            FailureCategory::Timeout
        );
        assert_eq!(
            categorize_failure("missing required env VAR_NAME"),
            FailureCategory::ConfigurationError
        );
        assert_eq!(
            categorize_failure("something completely novel"),
            FailureCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_first_match_wins() {
        // Dependency noise before a timeout mention resolves as dependency.
        assert_eq!(
            categorize_failure("npm ERR! request timed out"),
            FailureCategory::DependencyIssue
        );
    }

    #[test]
    fn test_transient_categories() {
        assert!(FailureCategory::DependencyIssue.is_transient());
        assert!(FailureCategory::Timeout.is_transient());
        assert!(FailureCategory::InfrastructureError.is_transient());
        assert!(!FailureCategory::BuildError.is_transient());
        assert!(!FailureCategory::Unknown.is_transient());
    }

    #[test]
    fn test_suggested_fix_never_empty() {
        for category in [
            FailureCategory::BuildError,
            FailureCategory::TestFailure,
            FailureCategory::DependencyIssue,
            FailureCategory::ConfigurationError,
            FailureCategory::InfrastructureError,
            FailureCategory::Timeout,
            FailureCategory::Unknown,
        ] {
            assert!(!suggested_fix(category).is_empty());
        }
    }

    #[test]
    fn test_issue_body_contains_category_and_logs() {
        let diagnosis = Diagnosis {
            run_id: 7,
            category: FailureCategory::BuildError,
            summary: "Workflow: CI".to_string(),
            suggested_fix: suggested_fix(FailureCategory::BuildError).to_string(),
            raw_logs: "error TS2304".to_string(),
        };
        let body = format_issue_body(&diagnosis);
        assert!(body.contains("BUILD_ERROR"));
        assert!(body.contains("error TS2304"));
        assert!(body.contains("**Run ID:** 7"));
    }
}
