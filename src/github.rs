//! GitHub REST API integration
//!
//! Workflow-run inspection, reruns, issues, and pull requests, all through
//! the REST API with a token, no `gh` CLI required. Error bodies from the
//! API are sanitized before they reach logs so credentials can never leak.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::gitops::parse_github_repo;

const API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "mender-ci";
const ISSUE_LABEL: &str = "mender-ci";

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "auth",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let truncated = if body.len() > MAX_ERROR_BODY_LEN {
        format!(
            "{}... (truncated)",
            crate::util::truncate(body, MAX_ERROR_BODY_LEN)
        )
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(error details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub name: Option<String>,
    /// `queued`, `in_progress`, or `completed`.
    pub status: String,
    /// Present once the run completes: `success`, `failure`, `cancelled`, ...
    pub conclusion: Option<String>,
    pub html_url: String,
    pub created_at: String,
}

impl WorkflowRun {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    pub fn is_failed(&self) -> bool {
        self.is_completed() && self.conclusion.as_deref() == Some("failure")
    }
}

#[derive(Deserialize)]
struct WorkflowRunsResponse {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct JobsResponse {
    jobs: Vec<Job>,
}

#[derive(Deserialize)]
struct Job {
    name: String,
    conclusion: Option<String>,
    #[serde(default)]
    steps: Vec<JobStep>,
}

#[derive(Deserialize)]
struct JobStep {
    name: String,
    conclusion: Option<String>,
}

#[derive(Serialize)]
struct CreateIssueRequest<'a> {
    title: &'a str,
    body: &'a str,
    labels: Vec<&'a str>,
}

#[derive(Deserialize)]
struct CreateIssueResponse {
    html_url: String,
}

#[derive(Serialize)]
struct CreatePrRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Deserialize)]
struct CreatePrResponse {
    html_url: String,
}

#[derive(Deserialize)]
struct RepoInfoResponse {
    default_branch: String,
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    owner: String,
    repo: String,
}

impl GitHubClient {
    /// Build a client from config. Fails when no token is configured; every
    /// endpoint here needs one.
    pub fn new(config: &Config) -> Result<Self> {
        let token = config
            .github_token
            .clone()
            .ok_or_else(|| anyhow!("GITHUB_TOKEN is not set"))?;

        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base: API_BASE.to_string(),
            token,
            owner: config.github_owner.clone(),
            repo: config.github_repo.clone(),
        })
    }

    /// Point the client at a different API host (e.g. GitHub Enterprise).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(self.client.get(format!("{}{}", self.api_base, path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(self.client.post(format!("{}{}", self.api_base, path)))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn check(&self, response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow!(
            "GitHub API error during {} ({}): {}",
            what,
            status,
            sanitize_error_body(&body)
        ))
    }

    /// Most recent workflow runs for the configured repository.
    pub async fn latest_workflow_runs(&self, count: u32) -> Result<Vec<WorkflowRun>> {
        let path = format!(
            "/repos/{}/{}/actions/runs?per_page={}",
            self.owner, self.repo, count
        );
        let response = self
            .get(&path)
            .send()
            .await
            .context("Failed to list workflow runs")?;
        let response = self.check(response, "listing workflow runs").await?;
        let parsed: WorkflowRunsResponse = response
            .json()
            .await
            .context("Failed to parse workflow runs")?;
        Ok(parsed.workflow_runs)
    }

    /// Recent runs that completed with a failure conclusion.
    pub async fn failed_runs(&self) -> Result<Vec<WorkflowRun>> {
        let runs = self.latest_workflow_runs(20).await?;
        Ok(filter_failed(runs))
    }

    /// Per-job summary of a run: job and step names with their conclusions.
    /// The raw log archive needs a separate download endpoint; the job
    /// summary carries enough signal for diagnosis.
    pub async fn workflow_logs(&self, run_id: u64) -> Result<String> {
        let path = format!(
            "/repos/{}/{}/actions/runs/{}/jobs",
            self.owner, self.repo, run_id
        );
        let response = self
            .get(&path)
            .send()
            .await
            .context("Failed to fetch workflow jobs")?;
        let response = self.check(response, "fetching workflow jobs").await?;
        let parsed: JobsResponse = response
            .json()
            .await
            .context("Failed to parse workflow jobs")?;
        Ok(summarize_jobs(&parsed.jobs))
    }

    /// Re-run a workflow run.
    pub async fn rerun_workflow(&self, run_id: u64) -> Result<()> {
        let path = format!(
            "/repos/{}/{}/actions/runs/{}/rerun",
            self.owner, self.repo, run_id
        );
        let response = self
            .post(&path)
            .send()
            .await
            .context("Failed to trigger rerun")?;
        self.check(response, "rerunning workflow").await?;
        Ok(())
    }

    /// Open a labeled issue; returns its URL.
    pub async fn create_issue(&self, title: &str, body: &str) -> Result<String> {
        let path = format!("/repos/{}/{}/issues", self.owner, self.repo);
        let request = CreateIssueRequest {
            title,
            body,
            labels: vec![ISSUE_LABEL],
        };
        let response = self
            .post(&path)
            .json(&request)
            .send()
            .await
            .context("Failed to create issue")?;
        let response = self.check(response, "creating issue").await?;
        let parsed: CreateIssueResponse =
            response.json().await.context("Failed to parse issue")?;
        Ok(parsed.html_url)
    }

    /// Open a pull request from `branch` into the repository's default
    /// branch. Soft-fails: any error is logged and `None` is returned, since
    /// a missing PR should never sink a run that already pushed a fix.
    pub async fn create_pull_request(
        &self,
        repo_url: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Option<String> {
        match self.try_create_pull_request(repo_url, branch, title, body).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!("Could not create pull request: {}", err);
                None
            }
        }
    }

    async fn try_create_pull_request(
        &self,
        repo_url: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let (owner, repo) = parse_github_repo(repo_url)
            .ok_or_else(|| anyhow!("Cannot parse GitHub owner/repo from '{}'", repo_url))?;

        let info_path = format!("/repos/{}/{}", owner, repo);
        let response = self
            .get(&info_path)
            .send()
            .await
            .context("Failed to fetch repository info")?;
        let response = self.check(response, "resolving default branch").await?;
        let info: RepoInfoResponse = response
            .json()
            .await
            .context("Failed to parse repository info")?;

        let request = CreatePrRequest {
            title,
            body,
            head: branch,
            base: &info.default_branch,
        };
        let pulls_path = format!("/repos/{}/{}/pulls", owner, repo);
        let response = self
            .post(&pulls_path)
            .json(&request)
            .send()
            .await
            .context("Failed to send PR creation request")?;
        let response = self.check(response, "creating pull request").await?;
        let parsed: CreatePrResponse = response.json().await.context("Failed to parse PR")?;
        Ok(parsed.html_url)
    }
}

fn filter_failed(runs: Vec<WorkflowRun>) -> Vec<WorkflowRun> {
    runs.into_iter().filter(WorkflowRun::is_failed).collect()
}

fn summarize_jobs(jobs: &[Job]) -> String {
    let mut lines = Vec::new();
    for job in jobs {
        lines.push(format!(
            "job: {} — {}",
            job.name,
            job.conclusion.as_deref().unwrap_or("pending")
        ));
        for step in &job.steps {
            if step.conclusion.as_deref() == Some("failure") {
                lines.push(format!("  failed step: {}", step.name));
            }
        }
    }
    lines.join("\n")
}

/// Poll recent workflow runs until one for `branch` completes or the poll
/// budget is exhausted. Returns `Some(true)` on success, `Some(false)` on a
/// failure conclusion, `None` on timeout.
pub async fn wait_for_ci(
    client: &GitHubClient,
    branch: &str,
    polls: u32,
    interval: Duration,
) -> Option<bool> {
    for attempt in 1..=polls {
        tokio::time::sleep(interval).await;

        let runs = match client.latest_workflow_runs(10).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!("CI poll {}/{} failed: {}", attempt, polls, err);
                continue;
            }
        };

        let matched = runs
            .iter()
            .find(|r| r.is_completed() && r.html_url.contains(branch));
        if let Some(run) = matched {
            return Some(run.conclusion.as_deref() == Some("success"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: &str, conclusion: Option<&str>, url: &str) -> WorkflowRun {
        WorkflowRun {
            id: 1,
            name: Some("CI".to_string()),
            status: status.to_string(),
            conclusion: conclusion.map(String::from),
            html_url: url.to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_filter_failed_keeps_only_completed_failures() {
        let runs = vec![
            run("completed", Some("success"), "u1"),
            run("completed", Some("failure"), "u2"),
            run("in_progress", None, "u3"),
            run("completed", Some("cancelled"), "u4"),
        ];
        let failed = filter_failed(runs);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].html_url, "u2");
    }

    #[test]
    fn test_parse_workflow_runs_response() {
        let json = r#"{
            "workflow_runs": [{
                "id": 42,
                "name": "CI",
                "status": "completed",
                "conclusion": "failure",
                "html_url": "https://github.com/o/r/actions/runs/42",
                "created_at": "2024-01-01T00:00:00Z"
            }]
        }"#;
        let parsed: WorkflowRunsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.workflow_runs.len(), 1);
        assert!(parsed.workflow_runs[0].is_failed());
    }

    #[test]
    fn test_summarize_jobs_marks_failed_steps() {
        let json = r#"{
            "jobs": [{
                "name": "build",
                "conclusion": "failure",
                "steps": [
                    {"name": "checkout", "conclusion": "success"},
                    {"name": "run tests", "conclusion": "failure"}
                ]
            }]
        }"#;
        let parsed: JobsResponse = serde_json::from_str(json).unwrap();
        let summary = summarize_jobs(&parsed.jobs);
        assert!(summary.contains("job: build — failure"));
        assert!(summary.contains("failed step: run tests"));
        assert!(!summary.contains("checkout"));
    }

    #[test]
    fn test_sanitize_error_body_redacts_secrets() {
        assert_eq!(
            sanitize_error_body("bad credentials: token ghp_abc"),
            "(error details redacted - may contain sensitive data)"
        );
    }

    #[test]
    fn test_sanitize_error_body_truncates_long_bodies() {
        let long = "x".repeat(500);
        let out = sanitize_error_body(&long);
        assert!(out.ends_with("... (truncated)"));
        assert!(out.len() < 250);
    }

    #[test]
    fn test_sanitize_error_body_passes_short_benign_bodies() {
        assert_eq!(sanitize_error_body("Not Found"), "Not Found");
    }

    #[test]
    fn test_pr_request_serialization() {
        let request = CreatePrRequest {
            title: "Automated fix",
            body: "Fixes applied",
            head: "fix/mender-123",
            base: "main",
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"head\":\"fix/mender-123\""));
        assert!(json.contains("\"base\":\"main\""));
    }

    #[test]
    fn test_client_requires_token() {
        let config = Config::default();
        assert!(GitHubClient::new(&config).is_err());
    }

    /// Serve canned JSON bodies on a local listener, one connection each.
    fn spawn_stub(bodies: Vec<String>) -> String {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            for body in bodies {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = vec![0u8; 65536];
                let mut total = 0;
                loop {
                    match stream.read(&mut buf[total..]) {
                        Ok(0) => break,
                        Ok(n) => {
                            total += n;
                            let seen = &buf[..total];
                            if let Some(pos) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
                                let headers = String::from_utf8_lossy(&seen[..pos]).to_lowercase();
                                let content_length: usize = headers
                                    .lines()
                                    .find_map(|l| l.strip_prefix("content-length:"))
                                    .and_then(|v| v.trim().parse().ok())
                                    .unwrap_or(0);
                                if total >= pos + 4 + content_length {
                                    break;
                                }
                            }
                            if total == buf.len() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_create_pull_request_resolves_default_branch() {
        let base = spawn_stub(vec![
            r#"{"default_branch": "main"}"#.to_string(),
            r#"{"html_url": "https://github.com/owner/repo/pull/1"}"#.to_string(),
        ]);

        let config = Config {
            github_token: Some("tok".to_string()),
            http_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        let client = GitHubClient::new(&config).unwrap().with_api_base(base);

        let url = client
            .create_pull_request(
                "https://github.com/owner/repo.git",
                "fix/mender-1",
                "Automated fixes",
                "body",
            )
            .await;
        assert_eq!(
            url,
            Some("https://github.com/owner/repo/pull/1".to_string())
        );
    }

    #[tokio::test]
    async fn test_create_pull_request_soft_fails_on_bad_url() {
        let config = Config {
            github_token: Some("tok".to_string()),
            ..Config::default()
        };
        let client = GitHubClient::new(&config).unwrap();

        let url = client
            .create_pull_request("not-a-github-url", "b", "t", "body")
            .await;
        assert_eq!(url, None);
    }
}
