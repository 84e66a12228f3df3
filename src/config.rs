//! Configuration for the healing pipeline
//!
//! One `Config` is built from the environment at process start and passed by
//! reference into every component constructor. Pipeline code never reads the
//! environment directly, so components stay independently testable.

use std::env;
use std::time::Duration;

/// Bounds applied to caller-supplied retry limits.
pub const RETRY_LIMIT_MIN: u32 = 1;
pub const RETRY_LIMIT_MAX: u32 = 20;

#[derive(Debug, Clone)]
pub struct Config {
    /// GitHub access token used for push auth and the REST API.
    pub github_token: Option<String>,
    /// Owner/repo the workflow-run endpoints operate on.
    pub github_owner: String,
    pub github_repo: String,
    /// Chat-completions endpoint of the code-generation backend.
    pub llm_api_url: String,
    pub llm_api_key: String,
    /// Model identifier sent to the backend.
    pub llm_model: String,
    /// Defaults used when the caller does not name a team/leader.
    pub team_name: String,
    pub leader_name: String,
    /// Default retry budget for the healing loop.
    pub retry_limit: u32,
    /// When false, tests always run via the direct shell fallback. Useful on
    /// hosts where Docker-in-Docker misbehaves.
    pub docker_enabled: bool,
    /// Wall-clock budget for one sandboxed install+test run.
    pub test_timeout: Duration,
    /// Per-request budget for backend and hosting-API calls.
    pub http_timeout: Duration,
}

fn optional_env(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl Config {
    /// Build a Config from the environment. `.env` is preloaded best-effort;
    /// a missing file is not an error.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            github_token: env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
            github_owner: optional_env("GITHUB_OWNER", ""),
            github_repo: optional_env("GITHUB_REPO", ""),
            llm_api_url: optional_env(
                "LLM_API_URL",
                "https://integrate.api.nvidia.com/v1/chat/completions",
            ),
            llm_api_key: optional_env("LLM_API_KEY", ""),
            llm_model: optional_env("LLM_MODEL", "qwen/qwen3.5-397b-a17b"),
            team_name: optional_env("TEAM_NAME", "TEAM"),
            leader_name: optional_env("LEADER_NAME", "LEADER"),
            retry_limit: clamp_retry_limit(parse_env("RETRY_LIMIT", 5)),
            docker_enabled: parse_env("DOCKER_ENABLED", true),
            test_timeout: Duration::from_secs(parse_env("TEST_TIMEOUT_SECS", 120)),
            http_timeout: Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS", 60)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github_token: None,
            github_owner: String::new(),
            github_repo: String::new(),
            llm_api_url: String::new(),
            llm_api_key: String::new(),
            llm_model: "qwen/qwen3.5-397b-a17b".to_string(),
            team_name: "TEAM".to_string(),
            leader_name: "LEADER".to_string(),
            retry_limit: 5,
            docker_enabled: true,
            test_timeout: Duration::from_secs(120),
            http_timeout: Duration::from_secs(60),
        }
    }
}

/// Clamp a caller-supplied retry limit into the supported range.
pub fn clamp_retry_limit(limit: u32) -> u32 {
    limit.clamp(RETRY_LIMIT_MIN, RETRY_LIMIT_MAX)
}
