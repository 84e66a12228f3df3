//! Sandboxed test execution
//!
//! Runs a repository's install+test pipeline inside a locked-down Docker
//! container: no network, capped memory/CPU/pids, read-only rootfs with
//! explicit tmpfs mounts, and the project mounted read-only. The code under
//! test must not be able to exfiltrate data or persist changes.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::probe::Language;
use crate::util::{run_with_timeout, truncate, CommandRunResult};

/// Cap on stored test output; anything past this is noise for the classifier.
pub const MAX_OUTPUT_CHARS: usize = 50_000;

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(5);
const IMAGE_BUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Shell metacharacters stripped from clauses that fail the allow-list.
const FORBIDDEN_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '!', '\\', '<', '>',
];

#[derive(Debug, Clone)]
pub struct TestRunOutcome {
    pub passed: bool,
    pub output: String,
    pub execution_time: Duration,
    pub container_id: String,
}

impl TestRunOutcome {
    pub fn from_run(result: &CommandRunResult, container_id: String, timeout: Duration) -> Self {
        let mut output = truncate(&result.combined_output(), MAX_OUTPUT_CHARS);
        if result.timed_out {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&format!(
                "[mender] test run timed out after {}s",
                timeout.as_secs()
            ));
        }
        Self {
            passed: result.success(),
            output,
            execution_time: result.duration,
            container_id,
        }
    }
}

fn custom_image(language: Language) -> &'static str {
    match language {
        Language::Node => "mender-agent:node",
        Language::Python => "mender-agent:python",
        Language::Unknown => "ubuntu:22.04",
    }
}

/// Stock images used when the custom build is unavailable.
fn base_image(language: Language) -> &'static str {
    match language {
        Language::Node => "node:20-alpine",
        Language::Python => "python:3.12-slim",
        Language::Unknown => "ubuntu:22.04",
    }
}

pub struct DockerSandbox {
    timeout: Duration,
    /// Directory holding the custom Dockerfiles; build is best-effort.
    docker_dir: PathBuf,
}

impl DockerSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            docker_dir: PathBuf::from("docker"),
        }
    }

    /// Probe the Docker daemon. Checked before every run; the orchestrator
    /// degrades to direct shell execution when this returns false.
    pub async fn is_docker_available(&self) -> bool {
        let mut cmd = Command::new("docker");
        cmd.arg("info");
        match run_with_timeout(&mut cmd, AVAILABILITY_TIMEOUT).await {
            Ok(result) if result.success() => true,
            _ => {
                warn!("Docker is not available on this host");
                false
            }
        }
    }

    /// Build the custom agent images once at startup. A failed build is
    /// logged and the stock base image is used instead; never fatal.
    pub async fn build_custom_images(&self) {
        let builds = [
            ("mender-agent:python", "python.Dockerfile"),
            ("mender-agent:node", "node.Dockerfile"),
        ];

        for (tag, dockerfile) in builds {
            if self.image_exists(tag).await {
                info!("Image {} already exists", tag);
                continue;
            }

            let dockerfile_path = self.docker_dir.join(dockerfile);
            info!("Building {} from {}...", tag, dockerfile);

            let mut cmd = Command::new("docker");
            cmd.args(["build", "-t", tag, "-f"])
                .arg(&dockerfile_path)
                .arg(&self.docker_dir);

            match run_with_timeout(&mut cmd, IMAGE_BUILD_TIMEOUT).await {
                Ok(result) if result.success() => info!("Built image: {}", tag),
                Ok(result) => warn!(
                    "Failed to build {}: {} — will use base image",
                    tag,
                    truncate(result.stderr.trim(), 300)
                ),
                Err(e) => warn!("Failed to build {}: {} — will use base image", tag, e),
            }
        }
    }

    async fn image_exists(&self, tag: &str) -> bool {
        let mut cmd = Command::new("docker");
        cmd.args(["image", "inspect", tag]);
        matches!(run_with_timeout(&mut cmd, Duration::from_secs(10)).await, Ok(r) if r.success())
    }

    /// Run `install && test` for the project inside the sandbox.
    ///
    /// `passed` is true iff the composed pipeline exits zero. A timeout
    /// produces `passed = false` with a timeout marker in the output, not an
    /// error.
    pub async fn run_tests(
        &self,
        project_path: &Path,
        language: Language,
        install_command: &str,
        test_command: &str,
    ) -> TestRunOutcome {
        let image = {
            let custom = custom_image(language);
            if self.image_exists(custom).await {
                custom.to_string()
            } else {
                base_image(language).to_string()
            }
        };
        let container_id = generate_container_name();

        let shell_line = build_shell_line(install_command, test_command);
        info!(
            "Running tests in Docker: image={} container={} cmd=\"{}\"",
            image, container_id, shell_line
        );

        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "--name", &container_id])
            // Hard isolation requirements; see module docs.
            .args(["--network", "none"])
            .args(["--memory", "512m"])
            .args(["--cpus", "1"])
            .args(["--pids-limit", "256"])
            .arg("--read-only")
            .args(["--tmpfs", "/tmp:rw,noexec,nosuid,size=256m"])
            .args(["--tmpfs", "/app/node_modules:rw,exec,size=512m"])
            .args(["--tmpfs", "/root/.cache:rw,size=256m"])
            .arg("-v")
            .arg(format!("{}:/app:ro", project_path.display()))
            .args(["-w", "/app"])
            .arg(&image)
            .args(["sh", "-c", &shell_line]);

        match run_with_timeout(&mut cmd, self.timeout).await {
            Ok(result) => {
                let outcome = TestRunOutcome::from_run(&result, container_id, self.timeout);
                info!(
                    "Docker test {} in {}ms",
                    if outcome.passed { "PASSED" } else { "FAILED" },
                    outcome.execution_time.as_millis()
                );
                if !outcome.output.is_empty() {
                    debug!("Docker output preview: {}", truncate(&outcome.output, 500));
                }
                outcome
            }
            Err(e) => TestRunOutcome {
                passed: false,
                output: format!("Docker execution error: {}", e),
                execution_time: Duration::ZERO,
                container_id,
            },
        }
    }
}

fn generate_container_name() -> String {
    format!("mender-agent-{}", uuid::Uuid::new_v4().simple())
}

fn build_shell_line(install_command: &str, test_command: &str) -> String {
    let safe_install = sanitize_command(install_command);
    let safe_test = sanitize_command(test_command);
    format!("cd /app && {} && {}", safe_install, safe_test)
}

fn allowed_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^npm\s+(ci|install|test|run\s+[\w:.-]+)$",
            r"^yarn\s+(install|test|run\s+[\w:.-]+)",
            r"^pnpm\s+(install|test|run\s+[\w:.-]+)",
            r"^pip\s+install\s+",
            r"^pipenv\s+install",
            r"^pytest",
            r"^python\s+-m\s+pytest",
            r"^python3?\s+[\w./-]+\.py",
            r"^tox$",
            r"^echo\s+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("allow-list pattern"))
        .collect()
    })
}

fn is_allowed_command(clause: &str) -> bool {
    let clause = clause.trim();
    allowed_patterns().iter().any(|p| p.is_match(clause))
}

/// Defense-in-depth command filter. Each `&&`-separated clause is checked
/// against the allow-list of known command shapes; anything else has shell
/// metacharacters stripped rather than being rejected outright, so a
/// best-effort command stays runnable.
pub fn sanitize_command(command: &str) -> String {
    command
        .split("&&")
        .map(|part| {
            let part = part.trim();
            if is_allowed_command(part) {
                part.to_string()
            } else {
                part.chars()
                    .filter(|c| !FORBIDDEN_CHARS.contains(c))
                    .collect()
            }
        })
        .collect::<Vec<_>>()
        .join(" && ")
}
