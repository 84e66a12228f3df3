//! Healing orchestrator
//!
//! Drives one run end to end: clone and probe the repository, then loop up
//! to the retry limit through test → classify → generate → apply → commit →
//! push → CI poll. Every transition appends a timeline entry; an attached
//! progress channel receives each entry as it happens, fire-and-forget, so a
//! slow or departed subscriber can never stall the loop.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::classify::{ClassifiedFailure, FailureClassifier};
use crate::config::{clamp_retry_limit, Config};
use crate::fixgen::{FixGenerator, GeneratedFix};
use crate::github::{self, GitHubClient};
use crate::gitops;
use crate::judge::format_all_failures_for_judge;
use crate::probe::{Language, RepoAnalysis, RepoProber};
use crate::sandbox::{DockerSandbox, TestRunOutcome, MAX_OUTPUT_CHARS};
use crate::util::{run_with_timeout, truncate, CommandRunResult};

const MAX_CI_POLLS: u32 = 6;
const CI_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub type ProgressSender = UnboundedSender<TimelineEntry>;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub repo_url: String,
    pub team_name: Option<String>,
    pub leader_name: Option<String>,
    pub retry_limit: Option<u32>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRecord {
    pub file: String,
    pub line: u32,
    pub bug_type: String,
    pub error: String,
    pub fix_applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub timestamp: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    #[serde(rename = "PASSED")]
    Passed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Passed => "PASSED",
            RunStatus::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorResult {
    pub repository: String,
    pub team_name: String,
    pub leader_name: String,
    pub branch: String,
    pub total_failures: usize,
    pub total_fixes: usize,
    pub iterations: u32,
    pub status: RunStatus,
    /// Milliseconds.
    pub time_taken: u64,
    pub fixes: Vec<FixRecord>,
    pub timeline: Vec<TimelineEntry>,
    pub formatted_failures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
}

/// What one pass through the loop decided about the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterationOutcome {
    /// Tests (or post-push CI) passed; the run is done.
    Pass,
    /// A fix landed or a push step degraded; worth another iteration.
    Retry,
    /// Nothing left to try; stop before the budget is spent.
    GiveUp,
}

pub struct Orchestrator {
    prober: RepoProber,
    classifier: FailureClassifier,
    fixer: FixGenerator,
    sandbox: DockerSandbox,
    progress: Option<ProgressSender>,
    results_path: PathBuf,
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            prober: RepoProber::new(),
            classifier: FailureClassifier::new(),
            fixer: FixGenerator::new(&config),
            sandbox: DockerSandbox::new(config.test_timeout),
            progress: None,
            results_path: PathBuf::from("results.json"),
            config,
        }
    }

    /// Attach a channel that receives each timeline entry as it is recorded.
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn with_prober(mut self, prober: RepoProber) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_results_path(mut self, path: PathBuf) -> Self {
        self.results_path = path;
        self
    }

    /// Run the full healing pipeline. Always returns a well-formed result,
    /// never panics out of a run.
    pub async fn run(&self, options: OrchestratorOptions) -> OrchestratorResult {
        let start = Instant::now();
        let mut timeline: Vec<TimelineEntry> = Vec::new();
        let mut all_fixes: Vec<FixRecord> = Vec::new();

        let team_name = options
            .team_name
            .clone()
            .unwrap_or_else(|| self.config.team_name.clone());
        let leader_name = options
            .leader_name
            .clone()
            .unwrap_or_else(|| self.config.leader_name.clone());
        let retry_limit =
            clamp_retry_limit(options.retry_limit.unwrap_or(self.config.retry_limit));

        self.add(
            &mut timeline,
            "ORCHESTRATOR_START",
            Some(format!("repo={}", options.repo_url)),
        );
        info!("Orchestrator starting for {}", options.repo_url);
        info!("Retry limit: {}", retry_limit);

        self.add(&mut timeline, "CLONE_START", None);
        let analysis = match self.prober.analyze(&options.repo_url).await {
            Ok(analysis) => analysis,
            Err(err) => {
                self.add(&mut timeline, "CLONE_FAILED", Some(err.to_string()));
                return build_result(
                    &options.repo_url,
                    team_name,
                    leader_name,
                    "unknown".to_string(),
                    RunStatus::Failed,
                    start,
                    timeline,
                    all_fixes,
                    0,
                    None,
                );
            }
        };
        self.add(
            &mut timeline,
            "CLONE_DONE",
            Some(format!("lang={}", analysis.language)),
        );

        let repo_path = analysis.local_path.clone();
        // Push straight to whatever branch the clone checked out.
        let branch_name =
            gitops::current_branch(&repo_path).unwrap_or_else(|_| "main".to_string());
        info!("Using default branch: {}", branch_name);

        if self.config.docker_enabled && self.sandbox.is_docker_available().await {
            self.sandbox.build_custom_images().await;
        }

        let mut iteration = 0u32;
        let mut passed = false;
        let mut pull_request_url: Option<String> = None;

        while iteration < retry_limit {
            iteration += 1;
            self.add(
                &mut timeline,
                "ITERATION_START",
                Some(format!("#{}", iteration)),
            );
            info!("──── Iteration {}/{} ────", iteration, retry_limit);

            let outcome = self
                .run_iteration(
                    &analysis,
                    &repo_path,
                    &branch_name,
                    &options,
                    iteration,
                    &mut timeline,
                    &mut all_fixes,
                    &mut pull_request_url,
                )
                .await;

            match outcome {
                IterationOutcome::Pass => {
                    passed = true;
                    break;
                }
                IterationOutcome::GiveUp => break,
                IterationOutcome::Retry => continue,
            }
        }

        let status = if passed {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        self.add(&mut timeline, "ORCHESTRATOR_DONE", Some(status.to_string()));

        let result = build_result(
            &options.repo_url,
            team_name,
            leader_name,
            branch_name,
            status,
            start,
            timeline,
            all_fixes,
            iteration,
            pull_request_url,
        );

        self.write_results(&result);
        info!("Finished: {} after {} iteration(s)", status, iteration);

        if let Err(err) = self.prober.cleanup(&repo_path) {
            warn!("Cleanup failed: {}", err);
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        &self,
        analysis: &RepoAnalysis,
        repo_path: &Path,
        branch_name: &str,
        options: &OrchestratorOptions,
        iteration: u32,
        timeline: &mut Vec<TimelineEntry>,
        all_fixes: &mut Vec<FixRecord>,
        pull_request_url: &mut Option<String>,
    ) -> IterationOutcome {
        self.add(
            timeline,
            "TEST_RUN_START",
            Some(format!("iteration={}", iteration)),
        );
        let test_result = self.run_tests_safe(analysis).await;

        if test_result.passed {
            self.add(
                timeline,
                "TESTS_PASSED",
                Some(format!("iteration={}", iteration)),
            );
            return IterationOutcome::Pass;
        }

        self.add(
            timeline,
            "TESTS_FAILED",
            Some(format!("iteration={}", iteration)),
        );
        info!("Tests failed on iteration {}", iteration);

        self.add(timeline, "CLASSIFY_START", None);
        let failures = self.classifier.classify(&test_result.output);

        if failures.is_empty() {
            return self
                .run_raw_output_fallback(
                    analysis,
                    repo_path,
                    branch_name,
                    options,
                    &test_result.output,
                    timeline,
                    all_fixes,
                    pull_request_url,
                )
                .await;
        }

        self.add(
            timeline,
            "CLASSIFY_DONE",
            Some(format!("found={}", failures.len())),
        );
        info!("Classified {} failure(s)", failures.len());

        for line in format_all_failures_for_judge(&failures) {
            info!("[JUDGE] {}", line);
            self.add(timeline, "CLASSIFIED_FAILURE", Some(line));
        }

        let file_contents = read_failing_files(repo_path, &failures);

        self.add(timeline, "FIX_GENERATE_START", None);
        let fixes = self.fixer.generate_fixes(&failures, &file_contents).await;
        self.add(
            timeline,
            "FIX_GENERATE_DONE",
            Some(format!("generated={}", fixes.len())),
        );

        if fixes.is_empty() {
            warn!("Fix generation returned 0 fixes — stopping");
            self.add(timeline, "NO_FIXES_GENERATED", None);
            return IterationOutcome::GiveUp;
        }

        self.add(timeline, "PATCH_APPLY_START", None);
        let applied = apply_fixes(repo_path, &fixes, all_fixes);
        self.add(
            timeline,
            "PATCH_APPLY_DONE",
            Some(format!("applied={}", applied)),
        );

        if applied == 0 {
            warn!("No patches were applied — stopping");
            return IterationOutcome::GiveUp;
        }

        let commit_msg = gitops::build_commit_message(&fixes);
        self.commit_changes(repo_path, &commit_msg);
        self.add(timeline, "COMMIT", Some(commit_msg));

        if options.dry_run {
            return IterationOutcome::Retry;
        }

        let push_ok = self
            .push_with_fallback(
                repo_path,
                branch_name,
                &options.repo_url,
                timeline,
                pull_request_url,
            )
            .await;

        if push_ok {
            self.add(timeline, "CI_MONITOR_START", None);
            let ci_passed = self.monitor_ci(branch_name).await;
            self.add(
                timeline,
                if ci_passed { "CI_PASSED" } else { "CI_FAILED" },
                None,
            );
            if ci_passed {
                return IterationOutcome::Pass;
            }
        }

        IterationOutcome::Retry
    }

    /// The classifier saw nothing structured: hand every source file plus
    /// the raw output to the backend and apply whatever comes back.
    #[allow(clippy::too_many_arguments)]
    async fn run_raw_output_fallback(
        &self,
        analysis: &RepoAnalysis,
        repo_path: &Path,
        branch_name: &str,
        options: &OrchestratorOptions,
        raw_output: &str,
        timeline: &mut Vec<TimelineEntry>,
        all_fixes: &mut Vec<FixRecord>,
        pull_request_url: &mut Option<String>,
    ) -> IterationOutcome {
        self.add(
            timeline,
            "CLASSIFY_REGEX_MISS",
            Some("Regex classifier found 0 failures — falling back to LLM analysis".to_string()),
        );
        warn!("Regex classifier found 0 structured failures — using LLM fallback with raw output");

        let source_files = read_all_source_files(repo_path, analysis.language);
        if !source_files.is_empty() {
            self.add(
                timeline,
                "FIX_GENERATE_START",
                Some("llm-fallback".to_string()),
            );
            let llm_fixes = self
                .fixer
                .generate_fixes_from_raw_output(raw_output, &source_files, analysis.language)
                .await;
            self.add(
                timeline,
                "FIX_GENERATE_DONE",
                Some(format!("generated={}", llm_fixes.len())),
            );

            if !llm_fixes.is_empty() {
                self.add(timeline, "PATCH_APPLY_START", None);
                let applied = apply_fixes(repo_path, &llm_fixes, all_fixes);
                self.add(
                    timeline,
                    "PATCH_APPLY_DONE",
                    Some(format!("applied={}", applied)),
                );

                if applied > 0 {
                    let commit_msg = gitops::build_commit_message(&llm_fixes);
                    self.commit_changes(repo_path, &commit_msg);
                    self.add(timeline, "COMMIT", Some(commit_msg));

                    if !options.dry_run {
                        self.push_with_fallback(
                            repo_path,
                            branch_name,
                            &options.repo_url,
                            timeline,
                            pull_request_url,
                        )
                        .await;
                    }
                    return IterationOutcome::Retry;
                }
            }
        }

        self.add(
            timeline,
            "CLASSIFY_NO_FAILURES",
            Some("Could not generate fixes from raw output either".to_string()),
        );
        IterationOutcome::GiveUp
    }

    async fn run_tests_safe(&self, analysis: &RepoAnalysis) -> TestRunOutcome {
        if self.config.docker_enabled && self.sandbox.is_docker_available().await {
            return self
                .sandbox
                .run_tests(
                    &analysis.local_path,
                    analysis.language,
                    &analysis.install_command,
                    &analysis.test_command,
                )
                .await;
        }

        warn!("Docker not available — running tests directly via shell");
        let start = Instant::now();
        let install = self
            .run_shell(&analysis.install_command, &analysis.local_path)
            .await;
        let test = self
            .run_shell(&analysis.test_command, &analysis.local_path)
            .await;

        let output = [
            install.stdout.as_str(),
            install.stderr.as_str(),
            test.stdout.as_str(),
            test.stderr.as_str(),
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");

        TestRunOutcome {
            passed: test.success(),
            output: truncate(&output, MAX_OUTPUT_CHARS),
            execution_time: start.elapsed(),
            container_id: "host".to_string(),
        }
    }

    async fn run_shell(&self, command: &str, dir: &Path) -> CommandRunResult {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]).current_dir(dir);
        match run_with_timeout(&mut cmd, self.config.test_timeout).await {
            Ok(result) => result,
            Err(err) => CommandRunResult {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("Shell execution error: {}", err),
                duration: Duration::ZERO,
                timed_out: false,
            },
        }
    }

    /// Stage and commit; a clean tree short-circuits with a warning.
    fn commit_changes(&self, repo_path: &Path, message: &str) -> bool {
        let counts = match gitops::working_tree_changes(repo_path) {
            Ok(counts) => counts,
            Err(err) => {
                warn!("Could not read git status: {}", err);
                return false;
            }
        };
        info!(
            "Git status: modified={}, created={}, deleted={}",
            counts.modified, counts.created, counts.deleted
        );

        if counts.is_clean() {
            warn!("No changes detected in working tree - nothing to commit");
            return false;
        }

        if let Err(err) = gitops::stage_all(repo_path) {
            warn!("Staging failed: {}", err);
            return false;
        }
        match gitops::commit(repo_path, message, "mender", "mender@users.noreply.github.com") {
            Ok(oid) => {
                info!("Committed: {} ({})", message, &oid[..7.min(oid.len())]);
                true
            }
            Err(err) => {
                warn!("Commit failed: {}", err);
                false
            }
        }
    }

    /// Push to the default branch; on failure, land the changes on a fix
    /// branch and open a PR instead.
    async fn push_with_fallback(
        &self,
        repo_path: &Path,
        branch: &str,
        repo_url: &str,
        timeline: &mut Vec<TimelineEntry>,
        pull_request_url: &mut Option<String>,
    ) -> bool {
        self.add(timeline, "PUSH_ATTEMPT", Some(format!("branch={}", branch)));

        if self.push_primary(repo_path, branch, repo_url) {
            self.add(timeline, "PUSH", Some(format!("Pushed to {}", branch)));
            return true;
        }

        self.add(
            timeline,
            "PUSH_FALLBACK",
            Some("Push to default branch failed - trying fix branch + PR".to_string()),
        );
        let (pushed, pr_url) = self.push_via_fix_branch(repo_path, repo_url, branch).await;

        if pushed {
            self.add(timeline, "PUSH", Some("Pushed via fix branch".to_string()));
            if let Some(url) = pr_url {
                self.add(timeline, "PR_CREATED", Some(url.clone()));
                *pull_request_url = Some(url);
            }
            true
        } else {
            self.add(
                timeline,
                "PUSH_FAILED",
                Some("Could not push - check token permissions".to_string()),
            );
            false
        }
    }

    fn push_primary(&self, repo_path: &Path, branch: &str, repo_url: &str) -> bool {
        let Some(token) = &self.config.github_token else {
            error!("No GitHub token provided - cannot push");
            return false;
        };

        // Best-effort: a URL we cannot parse keeps its existing remote.
        if let Err(err) = gitops::inject_token_into_remote(repo_path, repo_url, token) {
            warn!("Could not inject token into remote URL: {}", err);
        }

        match gitops::push_branch(repo_path, branch) {
            Ok(_) => {
                info!("Pushed to branch: {}", branch);
                true
            }
            Err(err) => {
                error!("Failed to push to {}: {}", branch, err);
                false
            }
        }
    }

    /// Returns `(pushed, pr_url)`. Always leaves the working tree back on
    /// the default branch, whatever happened.
    async fn push_via_fix_branch(
        &self,
        repo_path: &Path,
        repo_url: &str,
        default_branch: &str,
    ) -> (bool, Option<String>) {
        let fix_branch = match gitops::create_fix_branch(repo_path) {
            Ok(branch) => {
                info!("Created fix branch: {}", branch);
                branch
            }
            Err(err) => {
                error!("Could not create fix branch: {}", err);
                return (false, None);
            }
        };

        let pushed = match gitops::push_branch(repo_path, &fix_branch) {
            Ok(_) => {
                info!("Pushed fix branch: {}", fix_branch);
                true
            }
            Err(err) => {
                error!("Failed to push fix branch: {}", err);
                false
            }
        };

        let mut pr_url = None;
        if pushed {
            if let Ok(client) = GitHubClient::new(&self.config) {
                pr_url = client
                    .create_pull_request(
                        repo_url,
                        &fix_branch,
                        "[mender] Automated fixes",
                        &format!(
                            "Automated fixes applied by mender.\n\nFix branch: `{}`",
                            fix_branch
                        ),
                    )
                    .await;
            }
        }

        if let Err(err) = gitops::checkout_branch(repo_path, default_branch) {
            warn!("Could not switch back to {}: {}", default_branch, err);
        }

        (pushed, pr_url)
    }

    async fn monitor_ci(&self, branch: &str) -> bool {
        info!("Monitoring CI for branch: {}", branch);
        let client = match GitHubClient::new(&self.config) {
            Ok(client) => client,
            Err(err) => {
                warn!("Cannot monitor CI: {}", err);
                return false;
            }
        };

        match github::wait_for_ci(&client, branch, MAX_CI_POLLS, CI_POLL_INTERVAL).await {
            Some(passed) => passed,
            None => {
                warn!("CI monitoring timed out after {} polls", MAX_CI_POLLS);
                false
            }
        }
    }

    fn add(&self, timeline: &mut Vec<TimelineEntry>, event: &str, detail: Option<String>) {
        let entry = TimelineEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event: event.to_string(),
            detail,
        };
        timeline.push(entry.clone());
        // Fire-and-forget: a dropped receiver must never affect the run.
        if let Some(sender) = &self.progress {
            let _ = sender.send(entry);
        }
    }

    fn write_results(&self, result: &OrchestratorResult) {
        match serde_json::to_string_pretty(result) {
            Ok(json) => {
                if let Err(err) = fs::write(&self.results_path, json) {
                    error!(
                        "Failed to write {}: {}",
                        self.results_path.display(),
                        err
                    );
                } else {
                    info!("Results written to {}", self.results_path.display());
                }
            }
            Err(err) => error!("Failed to serialize results: {}", err),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_result(
    repo_url: &str,
    team_name: String,
    leader_name: String,
    branch: String,
    status: RunStatus,
    start: Instant,
    timeline: Vec<TimelineEntry>,
    all_fixes: Vec<FixRecord>,
    iterations: u32,
    pull_request_url: Option<String>,
) -> OrchestratorResult {
    let formatted_failures = timeline
        .iter()
        .filter(|t| t.event == "CLASSIFIED_FAILURE")
        .filter_map(|t| t.detail.clone())
        .collect();

    OrchestratorResult {
        repository: repo_url.to_string(),
        team_name,
        leader_name,
        branch,
        total_failures: all_fixes.len(),
        total_fixes: all_fixes.iter().filter(|f| f.fix_applied).count(),
        iterations,
        status,
        time_taken: start.elapsed().as_millis() as u64,
        fixes: all_fixes,
        timeline,
        formatted_failures,
        pull_request_url,
    }
}

/// Every source file for the language, keyed by repo-relative path.
/// Dependency and VCS directories are skipped.
fn read_all_source_files(repo_path: &Path, language: Language) -> BTreeMap<String, String> {
    let mut contents = BTreeMap::new();
    let extensions = language.source_extensions();

    for entry in WalkDir::new(repo_path).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(repo_path) else {
            continue;
        };
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if rel_str.contains("node_modules")
            || rel_str.contains("__pycache__")
            || rel_str.contains(".git")
        {
            continue;
        }
        if !extensions.iter().any(|ext| rel_str.ends_with(ext)) {
            continue;
        }
        if let Ok(content) = fs::read_to_string(entry.path()) {
            contents.insert(rel_str, content);
        }
    }

    contents
}

fn read_failing_files(
    repo_path: &Path,
    failures: &[ClassifiedFailure],
) -> HashMap<String, String> {
    let mut contents = HashMap::new();

    for failure in failures {
        if contents.contains_key(&failure.file) {
            continue;
        }
        let path = Path::new(&failure.file);
        let abs_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            repo_path.join(path)
        };

        match fs::read_to_string(&abs_path) {
            Ok(content) => {
                contents.insert(failure.file.clone(), content);
            }
            Err(_) => warn!("Could not read file: {}", abs_path.display()),
        }
    }

    contents
}

/// Write each fix to disk and record it in the ledger. Write failures are
/// recorded with `fix_applied = false`, never raised.
fn apply_fixes(repo_path: &Path, fixes: &[GeneratedFix], all_fixes: &mut Vec<FixRecord>) -> usize {
    let mut applied = 0;

    for fix in fixes {
        let path = Path::new(&fix.file);
        let abs_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            repo_path.join(path)
        };

        match fs::write(&abs_path, &fix.corrected_content) {
            Ok(()) => {
                applied += 1;
                all_fixes.push(FixRecord {
                    file: fix.file.clone(),
                    line: fix.line,
                    bug_type: fix.original_error.clone(),
                    error: fix.original_error.clone(),
                    fix_applied: true,
                });
                info!("Patched: {}", fix.file);
            }
            Err(err) => {
                error!("Failed to write fix to {}: {}", fix.file, err);
                all_fixes.push(FixRecord {
                    file: fix.file.clone(),
                    line: fix.line,
                    bug_type: fix.original_error.clone(),
                    error: err.to_string(),
                    fix_applied: false,
                });
            }
        }
    }

    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git_available() -> bool {
        StdCommand::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) {
        let out = StdCommand::new("git")
            .current_dir(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn init_repo(dir: &Path, files: &[(&str, &str)]) {
        git(dir, &["init"]);
        git(dir, &["config", "user.name", "tester"]);
        git(dir, &["config", "user.email", "tester@local"]);
        for (name, content) in files {
            fs::write(dir.join(name), content).unwrap();
        }
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "initial"]);
    }

    fn test_config() -> Config {
        Config {
            docker_enabled: false,
            test_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(5),
            ..Config::default()
        }
    }

    fn orchestrator_in(dir: &Path) -> Orchestrator {
        Orchestrator::new(test_config())
            .with_prober(RepoProber::with_base_dir(dir.join("clones")))
            .with_results_path(dir.join("results.json"))
    }

    fn event_index(timeline: &[TimelineEntry], event: &str) -> Option<usize> {
        timeline.iter().position(|t| t.event == event)
    }

    #[tokio::test]
    async fn test_unreachable_repo_fails_with_zero_iterations() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_in(dir.path());

        let result = orchestrator
            .run(OrchestratorOptions {
                repo_url: "file:///definitely/not/a/repo".to_string(),
                team_name: None,
                leader_name: None,
                retry_limit: Some(3),
                dry_run: true,
            })
            .await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.iterations, 0);
        assert!(event_index(&result.timeline, "CLONE_FAILED").is_some());
        assert!(event_index(&result.timeline, "TEST_RUN_START").is_none());
        assert_eq!(result.branch, "unknown");
    }

    #[tokio::test]
    async fn test_passing_repo_finishes_in_one_iteration() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        // No language markers: both detected commands are echo no-ops that
        // exit zero, so the first test run passes.
        init_repo(&source, &[("README.txt", "hello\n")]);

        let orchestrator = orchestrator_in(dir.path());
        let result = orchestrator
            .run(OrchestratorOptions {
                repo_url: format!("file://{}", source.display()),
                team_name: Some("TEAM".to_string()),
                leader_name: Some("LEAD".to_string()),
                retry_limit: Some(3),
                dry_run: true,
            })
            .await;

        assert_eq!(result.status, RunStatus::Passed);
        assert_eq!(result.iterations, 1);
        assert!(result.fixes.is_empty());
        let passed_at = event_index(&result.timeline, "TESTS_PASSED").unwrap();
        let done_at = event_index(&result.timeline, "ORCHESTRATOR_DONE").unwrap();
        assert!(passed_at < done_at);

        // Terminal result is persisted for out-of-band inspection.
        let written = fs::read_to_string(dir.path().join("results.json")).unwrap();
        assert!(written.contains("\"status\": \"PASSED\""));
        // The clone is removed at end of run.
        assert_eq!(fs::read_dir(dir.path().join("clones")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_progress_channel_receives_timeline_in_order() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        init_repo(&source, &[("README.txt", "hello\n")]);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let orchestrator = orchestrator_in(dir.path()).with_progress(tx);

        let result = orchestrator
            .run(OrchestratorOptions {
                repo_url: format!("file://{}", source.display()),
                team_name: None,
                leader_name: None,
                retry_limit: Some(1),
                dry_run: true,
            })
            .await;

        let mut streamed = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            streamed.push(entry.event);
        }
        let recorded: Vec<String> = result.timeline.iter().map(|t| t.event.clone()).collect();
        assert_eq!(streamed, recorded);
        assert_eq!(streamed.first().map(String::as_str), Some("ORCHESTRATOR_START"));
        assert_eq!(streamed.last().map(String::as_str), Some("ORCHESTRATOR_DONE"));
    }

    #[tokio::test]
    async fn test_dropped_progress_receiver_does_not_stall_run() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        init_repo(&source, &[("README.txt", "hello\n")]);

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<TimelineEntry>();
        drop(rx);
        let orchestrator = orchestrator_in(dir.path()).with_progress(tx);

        let result = orchestrator
            .run(OrchestratorOptions {
                repo_url: format!("file://{}", source.display()),
                team_name: None,
                leader_name: None,
                retry_limit: Some(1),
                dry_run: true,
            })
            .await;
        assert_eq!(result.status, RunStatus::Passed);
    }

    #[test]
    fn test_apply_fixes_records_write_failures_in_ledger() {
        let dir = TempDir::new().unwrap();
        let fixes = vec![
            GeneratedFix {
                file: "ok.py".to_string(),
                line: 1,
                original_error: "SyntaxError: invalid syntax".to_string(),
                corrected_content: "x = 1\n".to_string(),
            },
            GeneratedFix {
                file: "missing/dir/bad.py".to_string(),
                line: 2,
                original_error: "SyntaxError: invalid syntax".to_string(),
                corrected_content: "y = 2\n".to_string(),
            },
        ];

        let mut ledger = Vec::new();
        let applied = apply_fixes(dir.path(), &fixes, &mut ledger);

        assert_eq!(applied, 1);
        assert_eq!(ledger.len(), 2);
        assert!(ledger[0].fix_applied);
        assert!(!ledger[1].fix_applied);
        assert_eq!(
            fs::read_to_string(dir.path().join("ok.py")).unwrap(),
            "x = 1\n"
        );
        // Totals give partial credit even when some writes fail.
        assert_eq!(ledger.iter().filter(|f| f.fix_applied).count(), 1);
    }

    #[test]
    fn test_read_all_source_files_skips_dependency_dirs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__/a.py"), "cached\n").unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/b.py"), "y = 2\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "not source\n").unwrap();

        let files = read_all_source_files(dir.path(), Language::Python);
        let keys: Vec<&String> = files.keys().collect();
        assert_eq!(keys, vec!["a.py", "pkg/b.py"]);
    }

    #[test]
    fn test_build_result_extracts_formatted_failures() {
        let timeline = vec![
            TimelineEntry {
                timestamp: "t".to_string(),
                event: "CLASSIFIED_FAILURE".to_string(),
                detail: Some("SYNTAX error in a.py line 4 \u{2192} Fix: correct it".to_string()),
            },
            TimelineEntry {
                timestamp: "t".to_string(),
                event: "COMMIT".to_string(),
                detail: Some("[mender] Fix: a.py:4".to_string()),
            },
        ];
        let result = build_result(
            "url",
            "TEAM".to_string(),
            "LEAD".to_string(),
            "main".to_string(),
            RunStatus::Failed,
            Instant::now(),
            timeline,
            vec![
                FixRecord {
                    file: "a.py".to_string(),
                    line: 4,
                    bug_type: "SyntaxError".to_string(),
                    error: "SyntaxError".to_string(),
                    fix_applied: true,
                },
                FixRecord {
                    file: "b.py".to_string(),
                    line: 1,
                    bug_type: "TypeError".to_string(),
                    error: "disk full".to_string(),
                    fix_applied: false,
                },
            ],
            2,
            None,
        );

        assert_eq!(result.formatted_failures.len(), 1);
        assert!(result.formatted_failures[0].starts_with("SYNTAX error in a.py line 4"));
        assert_eq!(result.total_failures, 2);
        assert_eq!(result.total_fixes, 1);
    }

    #[test]
    fn test_result_serializes_with_camel_case_keys() {
        let result = build_result(
            "url",
            "TEAM".to_string(),
            "LEAD".to_string(),
            "main".to_string(),
            RunStatus::Passed,
            Instant::now(),
            Vec::new(),
            Vec::new(),
            1,
            Some("https://github.com/o/r/pull/1".to_string()),
        );
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"teamName\":\"TEAM\""));
        assert!(json.contains("\"totalFixes\":0"));
        assert!(json.contains("\"status\":\"PASSED\""));
        assert!(json.contains("\"pullRequestUrl\""));
    }
}
