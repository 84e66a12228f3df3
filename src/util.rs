use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

/// Truncate a string for display or storage (Unicode-safe).
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stdout and stderr joined with a newline, empty sections dropped.
    pub fn combined_output(&self) -> String {
        [self.stdout.as_str(), self.stderr.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run a command with a wall-clock timeout, capturing stdout and stderr.
///
/// On timeout the child is killed and the result carries `timed_out = true`
/// with whatever output was captured before the kill. Spawn failures are the
/// only error path; a nonzero exit is reported in the result, not as an Err.
pub async fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> anyhow::Result<CommandRunResult> {
    let start = Instant::now();

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("Failed to start command: {}", e))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout"))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr"))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let mut timed_out = false;
    let exit_code = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => return Err(anyhow::anyhow!("Failed to wait for command: {}", e)),
        Err(_) => {
            timed_out = true;
            let _ = child.kill().await;
            let _ = child.wait().await;
            None
        }
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();

    Ok(CommandRunResult {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        duration: start.elapsed(),
        timed_out,
    })
}

const RETRY_BACKOFF_CAP_MS: u64 = 15_000;

/// Run `f` up to `max_retries` times with capped exponential backoff.
///
/// Each attempt is logged under `label`; the last error is returned when the
/// budget is exhausted.
pub async fn with_retry<T, F, Fut>(label: &str, max_retries: u32, mut f: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last_error = None;

    for attempt in 1..=max_retries {
        info!("[{}] attempt {}/{}", label, attempt, max_retries);
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("[{}] attempt {} failed: {}", label, attempt, err);
                last_error = Some(err);

                if attempt < max_retries {
                    let delay_ms = (1000u64 << (attempt - 1)).min(RETRY_BACKOFF_CAP_MS);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("{}: all {} attempts exhausted", label, max_retries)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_truncate_unicode_safe() {
        assert_eq!(truncate("ééééé", 3), "ééé");
        assert_eq!(truncate("ok", 10), "ok");
        assert_eq!(truncate("", 0), "");
    }

    #[tokio::test]
    async fn test_run_with_timeout_captures_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let result = run_with_timeout(&mut cmd, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success());
        assert!(result.stdout.contains("out"));
        assert!(result.stderr.contains("err"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_run_with_timeout_kills_hung_process() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let start = Instant::now();
        let result = run_with_timeout(&mut cmd, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_with_timeout_zero_exit_is_success() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "true"]);
        let result = run_with_timeout(&mut cmd, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_with_retry_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("not yet"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn test_with_retry_returns_last_error() {
        let result: anyhow::Result<()> =
            with_retry("test", 1, || async { Err(anyhow::anyhow!("boom")) }).await;
        assert!(result.unwrap_err().to_string().contains("boom"));
    }
}
