//! Repository probing
//!
//! Clones a repository shallowly and infers its language, install command,
//! and test command from on-disk markers. The clone lives in a uniquely
//! named directory under a managed base dir so concurrent runs never collide
//! and cleanup can refuse to touch anything outside it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::util::run_with_timeout;

const CLONE_TIMEOUT: Duration = Duration::from_secs(120);

/// Placeholder test script npm writes into a fresh package.json.
const NPM_PLACEHOLDER_TEST: &str = "echo \"Error: no test specified\" && exit 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Node,
    Python,
    Unknown,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Node => "node",
            Language::Python => "python",
            Language::Unknown => "unknown",
        }
    }

    /// Source-file extensions scanned in the LLM raw-output fallback.
    pub fn source_extensions(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &[".py"],
            Language::Node => &[".js", ".ts", ".mjs", ".cjs", ".jsx", ".tsx"],
            Language::Unknown => &[".py", ".js", ".ts"],
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the orchestrator needs to know about a cloned repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoAnalysis {
    pub repo_url: String,
    pub local_path: PathBuf,
    pub language: Language,
    pub test_command: String,
    pub install_command: String,
    pub has_lock_file: bool,
    pub detected_files: Vec<String>,
}

const NODE_MARKERS: &[&str] = &[
    "package.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "package-lock.json",
];
const PYTHON_MARKERS: &[&str] = &[
    "requirements.txt",
    "setup.py",
    "pyproject.toml",
    "Pipfile",
    "setup.cfg",
];
const LOCK_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Pipfile.lock",
    "poetry.lock",
];

pub struct RepoProber {
    base_dir: PathBuf,
}

impl RepoProber {
    pub fn new() -> Self {
        Self::with_base_dir(std::env::temp_dir().join("mender-repos"))
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        if !base_dir.exists() {
            if let Err(e) = fs::create_dir_all(&base_dir) {
                warn!("Could not create repo base directory {}: {}", base_dir.display(), e);
            }
        }
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Clone `repo_url` and infer how to install and test it.
    pub async fn analyze(&self, repo_url: &str) -> Result<RepoAnalysis> {
        info!("Analyzing repository: {}", repo_url);

        let local_path = self.clone_repo(repo_url).await?;
        let files = list_top_level_files(&local_path);
        let language = detect_language(&files);
        let test_command = detect_test_command(&local_path, language, &files);
        let install_command = detect_install_command(language, &files);
        let has_lock_file = files.iter().any(|f| LOCK_FILES.contains(&f.as_str()));

        info!(
            "Analysis complete: language={} test=\"{}\" install=\"{}\" lockfile={}",
            language, test_command, install_command, has_lock_file
        );

        Ok(RepoAnalysis {
            repo_url: repo_url.to_string(),
            local_path,
            language,
            test_command,
            install_command,
            has_lock_file,
            detected_files: files,
        })
    }

    async fn clone_repo(&self, repo_url: &str) -> Result<PathBuf> {
        let repo_name = extract_repo_name(repo_url);
        let dir_name = format!("{}-{}", repo_name, chrono::Utc::now().timestamp_millis());
        let target = self.base_dir.join(dir_name);

        if target.exists() {
            info!("Directory exists, removing: {}", target.display());
            fs::remove_dir_all(&target)
                .with_context(|| format!("Failed to clear {}", target.display()))?;
        }

        info!("Cloning {} into {}", repo_url, target.display());
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", repo_url])
            .arg(&target)
            .env("GIT_TERMINAL_PROMPT", "0");

        let result = run_with_timeout(&mut cmd, CLONE_TIMEOUT).await?;
        if !result.success() {
            let detail = if result.timed_out {
                "clone timed out".to_string()
            } else {
                crate::util::truncate(result.stderr.trim(), 500)
            };
            anyhow::bail!("git clone failed for {}: {}", repo_url, detail);
        }

        Ok(target)
    }

    /// Delete a clone directory. Refuses to touch anything outside the
    /// managed base dir so an attacker-influenced path can never redirect
    /// the delete.
    pub fn cleanup(&self, local_path: &Path) -> Result<()> {
        let base = self
            .base_dir
            .canonicalize()
            .unwrap_or_else(|_| self.base_dir.clone());
        let target = local_path
            .canonicalize()
            .unwrap_or_else(|_| local_path.to_path_buf());

        if !target.starts_with(&base) || target == base {
            anyhow::bail!(
                "Refusing to delete path outside base dir: {}",
                local_path.display()
            );
        }

        fs::remove_dir_all(&target)
            .with_context(|| format!("Cleanup failed for {}", target.display()))?;
        info!("Cleaned up: {}", target.display());
        Ok(())
    }
}

impl Default for RepoProber {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_repo_name(repo_url: &str) -> String {
    let sanitized = repo_url.trim_end_matches('/').trim_end_matches(".git");
    let name = sanitized.rsplit('/').next().unwrap_or("repo");
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "repo".to_string()
    } else {
        cleaned
    }
}

fn list_top_level_files(dir: &Path) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect(),
        Err(_) => {
            warn!("Could not list files in {}", dir.display());
            Vec::new()
        }
    }
}

fn detect_language(files: &[String]) -> Language {
    let file_set: HashSet<&str> = files.iter().map(|s| s.as_str()).collect();

    for marker in NODE_MARKERS {
        if file_set.contains(marker) {
            info!("Detected language: node (marker: {})", marker);
            return Language::Node;
        }
    }
    for marker in PYTHON_MARKERS {
        if file_set.contains(marker) {
            info!("Detected language: python (marker: {})", marker);
            return Language::Python;
        }
    }

    // No manifest: fall back to top-level file extensions.
    if files.iter().any(|f| f.ends_with(".py")) {
        info!("Detected language: python (found .py files)");
        return Language::Python;
    }
    if files
        .iter()
        .any(|f| f.ends_with(".js") || f.ends_with(".ts") || f.ends_with(".mjs"))
    {
        info!("Detected language: node (found .js/.ts files)");
        return Language::Node;
    }

    warn!("Could not detect language from top-level files");
    Language::Unknown
}

fn detect_test_command(local_path: &Path, language: Language, files: &[String]) -> String {
    match language {
        Language::Node => detect_node_test_command(local_path),
        Language::Python => detect_python_test_command(files),
        Language::Unknown => "echo 'No test command detected'".to_string(),
    }
}

fn detect_node_test_command(local_path: &Path) -> String {
    let pkg_path = local_path.join("package.json");

    let scripts = fs::read_to_string(&pkg_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|pkg| pkg.get("scripts").cloned());

    let Some(scripts) = scripts else {
        warn!("Could not read package.json for test command detection");
        return "npm test".to_string();
    };

    let script = |name: &str| scripts.get(name).and_then(|v| v.as_str()).map(String::from);

    if let Some(test) = script("test") {
        if test != NPM_PLACEHOLDER_TEST {
            info!("Detected Node test script: \"{}\"", test);
            return "npm test".to_string();
        }
    }
    if script("test:ci").is_some() {
        return "npm run test:ci".to_string();
    }
    if script("test:unit").is_some() {
        return "npm run test:unit".to_string();
    }

    warn!("No meaningful test script found in package.json");
    "npm test".to_string()
}

fn detect_python_test_command(files: &[String]) -> String {
    let file_set: HashSet<&str> = files.iter().map(|s| s.as_str()).collect();

    if file_set.contains("pytest.ini")
        || file_set.contains("pyproject.toml")
        || file_set.contains("setup.cfg")
    {
        info!("Detected pytest configuration");
        return "pytest".to_string();
    }
    if file_set.contains("tox.ini") {
        info!("Detected tox configuration");
        return "tox".to_string();
    }

    let has_test_files = files
        .iter()
        .any(|f| f.ends_with(".py") && (f.starts_with("test_") || f.ends_with("_test.py")));
    if has_test_files {
        info!("Found test files, using pytest");
        return "pytest".to_string();
    }

    // No test framework at all: execute every top-level script directly so
    // that at least syntax and runtime errors surface.
    let py_files: Vec<&String> = files
        .iter()
        .filter(|f| f.ends_with(".py") && !f.starts_with("__"))
        .collect();
    if !py_files.is_empty() {
        let cmds = py_files
            .iter()
            .map(|f| format!("python {}", f))
            .collect::<Vec<_>>()
            .join(" && ");
        info!("No test framework — running Python files directly: {}", cmds);
        return cmds;
    }

    "pytest".to_string()
}

fn detect_install_command(language: Language, files: &[String]) -> String {
    let file_set: HashSet<&str> = files.iter().map(|s| s.as_str()).collect();

    match language {
        Language::Node => {
            // A committed lock file implies the reproducible install verb.
            if file_set.contains("package-lock.json") {
                "npm ci".to_string()
            } else if file_set.contains("yarn.lock") {
                "yarn install --frozen-lockfile".to_string()
            } else if file_set.contains("pnpm-lock.yaml") {
                "pnpm install --frozen-lockfile".to_string()
            } else {
                "npm install".to_string()
            }
        }
        Language::Python => {
            if file_set.contains("Pipfile") {
                "pipenv install".to_string()
            } else if file_set.contains("pyproject.toml") {
                "pip install -e .".to_string()
            } else if file_set.contains("requirements.txt") {
                "pip install -r requirements.txt".to_string()
            } else {
                "echo 'no dependencies to install'".to_string()
            }
        }
        Language::Unknown => "echo 'No install command detected'".to_string(),
    }
}
