//! Patch generation
//!
//! Asks the code-generation backend for corrected file content given a
//! classified failure (or raw test output as a fallback). The backend is
//! told to return raw file content only, but model output is untrusted:
//! every response passes through fence-stripping sanitization and a
//! best-effort explanation-detection heuristic, with a bounded retry before
//! giving up on a single fix.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::classify::ClassifiedFailure;
use crate::config::Config;
use crate::probe::Language;
use crate::util::truncate;

const MAX_LLM_RETRIES: u32 = 3;
const MAX_ERROR_BODY_CHARS: usize = 300;

const SYSTEM_PROMPT: &str = "You are an autonomous CI/CD healing agent. Return only corrected file content. \
Do not include any explanation, commentary, markdown fences, or triple backticks. \
Output ONLY the raw file content ready to be saved directly to disk. \
IMPORTANT: Python stops at the first SyntaxError, so the error output may only show one bug. \
You MUST proactively read the ENTIRE source code and fix ALL bugs — syntax errors, typos, \
type mismatches, missing colons, wrong variable names, incorrect operations — not just the one shown in the error output.";

/// Failure taxonomy for a single fix attempt. Batch callers catch these
/// per-file; none of them aborts a run.
#[derive(Debug, Error)]
pub enum FixGenError {
    #[error("backend returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned empty or invalid response")]
    EmptyResponse,
    #[error("backend returned explanation instead of file content after {attempts} attempts")]
    ExplanationOnly { attempts: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedFix {
    pub file: String,
    pub line: u32,
    pub original_error: String,
    /// Full replacement file content; never empty, always newline-terminated.
    pub corrected_content: String,
}

/// Tunable thresholds for the explanation detector. The defaults mirror the
/// values this pipeline has always shipped with; they are approximate by
/// design and both over- and under-rejection are possible.
#[derive(Debug, Clone, Copy)]
pub struct ExplanationHeuristic {
    /// Reject when the response is below this fraction of the original's
    /// line count...
    pub min_ratio: f64,
    /// ...and also below this many lines.
    pub min_lines: usize,
    /// Reject when at least this many of the scanned lines look like prose.
    pub starter_threshold: usize,
    /// How many leading non-blank lines to scan.
    pub scan_window: usize,
}

impl Default for ExplanationHeuristic {
    fn default() -> Self {
        Self {
            min_ratio: 0.3,
            min_lines: 5,
            starter_threshold: 3,
            scan_window: 10,
        }
    }
}

fn starter_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)^(Here|The|This|I |In |To |We |You |Note|Below|Above|Let me)",
            r"(?i)^(The fix|The error|The issue|The problem|The solution)",
            r"(?i)^(Step \d|First,|Second,|Finally,|However,|Therefore)",
            r"^\d+\.\s+\w",
            r"^[-*]\s+\w",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("starter pattern"))
        .collect()
    })
}

impl ExplanationHeuristic {
    /// Best-effort check for a model response that is commentary rather
    /// than file content.
    pub fn looks_like_explanation(&self, response: &str, original_content: &str) -> bool {
        let total_lines = response.lines().count();
        let original_lines = original_content.lines().count().max(1);

        // Far shorter than the original usually means prose, not code.
        if (total_lines as f64) < (original_lines as f64) * self.min_ratio
            && total_lines < self.min_lines
        {
            return true;
        }

        let starter_hits = response
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(self.scan_window)
            .filter(|l| starter_patterns().iter().any(|p| p.is_match(l)))
            .count();

        starter_hits >= self.starter_threshold
    }
}

/// Strip fences and normalize the trailing newline. Idempotent: sanitizing
/// already-sanitized content is a no-op.
pub fn sanitize_response(content: &str) -> String {
    static WRAPPING_FENCE: OnceLock<Regex> = OnceLock::new();
    static LEADING_FENCE: OnceLock<Regex> = OnceLock::new();
    static TRAILING_FENCE: OnceLock<Regex> = OnceLock::new();

    let wrapping =
        WRAPPING_FENCE.get_or_init(|| Regex::new(r"(?s)^```\w*\n(.*?)```$").expect("fence"));
    let leading = LEADING_FENCE.get_or_init(|| Regex::new(r"^```\w*\n?").expect("fence"));
    let trailing = TRAILING_FENCE.get_or_init(|| Regex::new(r"\n?```$").expect("fence"));

    let mut result = content.trim().to_string();

    if let Some(captures) = wrapping.captures(&result) {
        result = captures[1].to_string();
    }
    result = leading.replace(&result, "").to_string();
    result = trailing.replace(&result, "").to_string();
    result = result.replace("```", "");
    result = result.trim().to_string();

    if !result.is_empty() {
        result.push('\n');
    }
    result
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

pub struct FixGenerator {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    heuristic: ExplanationHeuristic,
}

impl FixGenerator {
    pub fn new(config: &Config) -> Self {
        Self::with_heuristic(config, ExplanationHeuristic::default())
    }

    pub fn with_heuristic(config: &Config, heuristic: ExplanationHeuristic) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_url: config.llm_api_url.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            heuristic,
        }
    }

    /// Generate a replacement for one failing file.
    pub async fn generate_fix(
        &self,
        failure: &ClassifiedFailure,
        file_content: &str,
    ) -> Result<GeneratedFix, FixGenError> {
        info!(
            "Generating fix for {} in {}:{}",
            failure.bug_type, failure.file, failure.line
        );

        let user_prompt = build_prompt(failure, file_content);
        let corrected_content = self.call_api_with_retry(&user_prompt, file_content).await?;

        Ok(GeneratedFix {
            file: failure.file.clone(),
            line: failure.line,
            original_error: failure.error_message.clone(),
            corrected_content,
        })
    }

    /// Generate fixes for a batch of failures. Files without content are
    /// skipped; individual errors are logged and excluded, never fatal.
    pub async fn generate_fixes(
        &self,
        failures: &[ClassifiedFailure],
        file_contents: &HashMap<String, String>,
    ) -> Vec<GeneratedFix> {
        let mut fixes = Vec::new();

        for failure in failures {
            let Some(content) = file_contents.get(&failure.file) else {
                warn!("No file content available for {}, skipping", failure.file);
                continue;
            };

            match self.generate_fix(failure, content).await {
                Ok(fix) => fixes.push(fix),
                Err(err) => warn!("Failed to generate fix for {}: {}", failure.file, err),
            }
        }

        info!("Generated {}/{} fix(es)", fixes.len(), failures.len());
        fixes
    }

    /// Fallback path: the classifier found nothing structured, so every
    /// source file is sent individually with the full raw output as context.
    /// A fix is only emitted when the model actually changed the content;
    /// no-op responses are discarded, not recorded as failed.
    pub async fn generate_fixes_from_raw_output(
        &self,
        raw_test_output: &str,
        source_files: &BTreeMap<String, String>,
        language: Language,
    ) -> Vec<GeneratedFix> {
        info!(
            "LLM fallback: sending raw output + {} source file(s) to fix",
            source_files.len()
        );
        let mut fixes = Vec::new();

        for (file_path, content) in source_files {
            let prompt = build_raw_output_prompt(raw_test_output, file_path, content, language);

            match self.call_api_with_retry(&prompt, content).await {
                Ok(corrected) => {
                    if corrected.trim() != content.trim() {
                        info!("LLM generated fix for {}", file_path);
                        fixes.push(GeneratedFix {
                            file: file_path.clone(),
                            line: 1,
                            original_error: "Detected from raw test output".to_string(),
                            corrected_content: corrected,
                        });
                    } else {
                        info!("LLM returned unchanged content for {}", file_path);
                    }
                }
                Err(err) => warn!("LLM fallback failed for {}: {}", file_path, err),
            }
        }

        info!("LLM fallback generated {} fix(es)", fixes.len());
        fixes
    }

    async fn call_api_with_retry(
        &self,
        user_prompt: &str,
        original_content: &str,
    ) -> Result<String, FixGenError> {
        for attempt in 1..=MAX_LLM_RETRIES {
            info!("Backend call — attempt {}/{}", attempt, MAX_LLM_RETRIES);
            let raw = self.call_api(user_prompt).await?;
            let cleaned = sanitize_response(&raw);

            if cleaned.is_empty() {
                return Err(FixGenError::EmptyResponse);
            }

            if self
                .heuristic
                .looks_like_explanation(&cleaned, original_content)
            {
                warn!(
                    "Attempt {}: backend returned explanation instead of file content — rejecting",
                    attempt
                );
                continue;
            }

            return Ok(cleaned);
        }

        Err(FixGenError::ExplanationOnly {
            attempts: MAX_LLM_RETRIES,
        })
    }

    async fn call_api(&self, user_prompt: &str) -> Result<String, FixGenError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.6,
            top_p: 0.95,
            max_tokens: 16_384,
            stream: false,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(FixGenError::Http {
                status: status.as_u16(),
                detail: truncate(&text, MAX_ERROR_BODY_CHARS),
            });
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|_| FixGenError::EmptyResponse)?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(FixGenError::EmptyResponse);
        }

        info!("Backend returned {} chars", content.len());
        Ok(content)
    }
}

fn build_prompt(failure: &ClassifiedFailure, file_content: &str) -> String {
    format!(
        "File: {}\n\
         Error type: {}\n\
         Line: {}\n\
         Error: {}\n\
         \n\
         Current file content:\n\
         {}\n\
         \n\
         Return ONLY the corrected file content.\n\
         Do NOT include markdown fences, triple backticks, explanations, or any commentary.\n\
         Output raw file content ONLY.",
        failure.file, failure.bug_type, failure.line, failure.error_message, file_content
    )
}

fn build_raw_output_prompt(
    raw_test_output: &str,
    file_path: &str,
    content: &str,
    language: Language,
) -> String {
    format!(
        "Language: {}\n\
         File: {}\n\
         \n\
         Test / execution output (may only show the FIRST error — Python stops at the first SyntaxError):\n\
         {}\n\
         \n\
         Current content of {}:\n\
         {}\n\
         \n\
         CRITICAL INSTRUCTIONS:\n\
         1. Fix ALL errors in this file — not just the one shown in the test output.\n\
         2. Python only reports the first SyntaxError, so there may be MORE bugs hiding after it.\n\
         3. Read every line of the source carefully. Fix syntax errors, typos, type mismatches,\n\
            missing colons, wrong variable names, incorrect string/int operations, etc.\n\
         4. Return ONLY the corrected file content — no markdown fences, no backticks, no commentary.\n\
         5. Output raw file content ONLY.",
        language, file_path, raw_test_output, file_path, content
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::BugType;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_sanitize_strips_wrapping_fence() {
        assert_eq!(sanitize_response("```python\nx = 1\n```"), "x = 1\n");
        assert_eq!(sanitize_response("```\nx = 1\n```"), "x = 1\n");
    }

    #[test]
    fn test_sanitize_strips_stray_fences() {
        assert_eq!(sanitize_response("x = 1\n```\ny = 2"), "x = 1\n\ny = 2\n");
    }

    #[test]
    fn test_sanitize_adds_single_trailing_newline() {
        assert_eq!(sanitize_response("x = 1"), "x = 1\n");
        assert_eq!(sanitize_response("x = 1\n\n\n"), "x = 1\n");
        assert_eq!(sanitize_response(""), "");
        assert_eq!(sanitize_response("   \n  "), "");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = [
            "```python\ndef f():\n    return 1\n```",
            "plain content\nwith lines",
            "",
        ];
        for input in inputs {
            let once = sanitize_response(input);
            let twice = sanitize_response(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", input);
        }
    }

    // The heuristic is best-effort by design; these tests pin the intended
    // behavior at the default thresholds, not a guarantee about arbitrary
    // model output.
    #[test]
    fn test_heuristic_rejects_short_response_for_long_original() {
        let heuristic = ExplanationHeuristic::default();
        let original = "line\n".repeat(40);
        assert!(heuristic.looks_like_explanation("The fix is to add a colon.", &original));
    }

    #[test]
    fn test_heuristic_rejects_prose_starters() {
        let heuristic = ExplanationHeuristic::default();
        let original = "x = 1\ny = 2\n";
        let response = "Here is the corrected file.\n\
                        The issue was a missing colon.\n\
                        1. Add the colon\n\
                        x = 1\ny = 2\n";
        assert!(heuristic.looks_like_explanation(response, original));
    }

    #[test]
    fn test_heuristic_accepts_plain_code() {
        let heuristic = ExplanationHeuristic::default();
        let original = "def add(a, b):\n    return a + b\n";
        let response = "def add(a, b):\n    return a + b\n\ndef sub(a, b):\n    return a - b\n";
        assert!(!heuristic.looks_like_explanation(response, original));
    }

    #[test]
    fn test_heuristic_accepts_short_fix_for_short_original() {
        let heuristic = ExplanationHeuristic::default();
        assert!(!heuristic.looks_like_explanation("x = 2\n", "x = 1\n"));
    }

    #[test]
    fn test_heuristic_thresholds_are_tunable() {
        let strict = ExplanationHeuristic {
            starter_threshold: 1,
            ..Default::default()
        };
        let original = "a\nb\nc\nd\ne\nf\n";
        let response = "Note that this file is fine.\na\nb\nc\nd\ne\nf\n";
        assert!(strict.looks_like_explanation(response, original));
        assert!(!ExplanationHeuristic::default().looks_like_explanation(response, original));
    }

    // ── Stub backend ──────────────────────────────────────────────────────

    /// Serve one canned chat-completions body per queued response on a
    /// local listener, one connection each.
    fn spawn_stub(responses: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = vec![0u8; 65536];
                let mut total = 0;
                // Read until the end of headers; enough for these tests.
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
                let reason = if status == 200 { "OK" } else { "Error" };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        format!("http://{}/v1/chat/completions", addr)
    }

    fn chat_body(content: &str) -> String {
        serde_json::to_string(&serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        }))
        .unwrap()
    }

    fn test_config(api_url: String) -> Config {
        Config {
            llm_api_url: api_url,
            llm_api_key: "test-key".to_string(),
            http_timeout: std::time::Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn sample_failure() -> ClassifiedFailure {
        ClassifiedFailure {
            bug_type: BugType::Syntax,
            file: "a.py".to_string(),
            line: 4,
            error_message: "SyntaxError: invalid syntax".to_string(),
            fix: "Fix: correct syntax error".to_string(),
            raw: String::new(),
        }
    }

    #[tokio::test]
    async fn test_generate_fix_sanitizes_fenced_response() {
        let url = spawn_stub(vec![(200, chat_body("```python\nx = 1\n```"))]);
        let generator = FixGenerator::new(&test_config(url));

        let fix = generator
            .generate_fix(&sample_failure(), "x = \n")
            .await
            .unwrap();
        assert_eq!(fix.corrected_content, "x = 1\n");
        assert_eq!(fix.file, "a.py");
        assert_eq!(fix.line, 4);
    }

    #[tokio::test]
    async fn test_generate_fix_retries_past_explanation() {
        let url = spawn_stub(vec![
            (200, chat_body("The fix is simple.")),
            (200, chat_body("x = 1\ny = 2\nz = 3\nw = 4\nv = 5\n")),
        ]);
        let generator = FixGenerator::new(&test_config(url));

        let original = "a\n".repeat(30);
        let fix = generator
            .generate_fix(&sample_failure(), &original)
            .await
            .unwrap();
        assert!(fix.corrected_content.starts_with("x = 1"));
    }

    #[tokio::test]
    async fn test_generate_fix_exhausts_retries_on_persistent_explanation() {
        let prose = chat_body("Here is what went wrong.");
        let url = spawn_stub(vec![
            (200, prose.clone()),
            (200, prose.clone()),
            (200, prose),
        ]);
        let generator = FixGenerator::new(&test_config(url));

        let original = "a\n".repeat(30);
        let err = generator
            .generate_fix(&sample_failure(), &original)
            .await
            .unwrap_err();
        assert!(matches!(err, FixGenError::ExplanationOnly { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_http_error_carries_status() {
        let url = spawn_stub(vec![(500, "internal".to_string())]);
        let generator = FixGenerator::new(&test_config(url));

        let err = generator
            .generate_fix(&sample_failure(), "x = 1\n")
            .await
            .unwrap_err();
        assert!(matches!(err, FixGenError::Http { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_batch_skips_missing_content_and_errors() {
        let url = spawn_stub(vec![(200, chat_body("fixed = True\n"))]);
        let generator = FixGenerator::new(&test_config(url));

        let mut with_content = sample_failure();
        with_content.file = "present.py".to_string();
        let mut without_content = sample_failure();
        without_content.file = "absent.py".to_string();

        let mut contents = HashMap::new();
        contents.insert("present.py".to_string(), "fixed = False\n".to_string());

        let fixes = generator
            .generate_fixes(&[with_content, without_content], &contents)
            .await;
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].file, "present.py");
    }

    #[tokio::test]
    async fn test_raw_output_fallback_discards_noop_responses() {
        let unchanged = "x = 1\n";
        let url = spawn_stub(vec![
            (200, chat_body(unchanged)),
            (200, chat_body("x = 2\n")),
        ]);
        let generator = FixGenerator::new(&test_config(url));

        let mut files = BTreeMap::new();
        files.insert("same.py".to_string(), "x = 1\n".to_string());
        files.insert("changed.py".to_string(), "x = 1\n".to_string());

        let fixes = generator
            .generate_fixes_from_raw_output("boom", &files, Language::Python)
            .await;
        // BTreeMap order: changed.py first gets the unchanged reply.
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].file, "same.py");
        assert_eq!(fixes[0].corrected_content, "x = 2\n");
        assert_eq!(fixes[0].line, 1);
    }
}
