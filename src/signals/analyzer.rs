//! Classification of agent output.
//!
//! The agent prints either plain text, a single JSON result object
//! (`--output-format json`) or one JSON event per line (`stream-json`).
//! [`analyze_output`] accepts all three and extracts the signals the exit
//! policy and the circuit breaker act on.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::circuit_breaker::{error_lines, error_signature};

pub const STATUS_BLOCK_START: &str = "---RALPH_STATUS---";
pub const STATUS_BLOCK_END: &str = "---END_RALPH_STATUS---";

const MAX_SUMMARY_LEN: usize = 200;

static PERMISSION_DENIED_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)permission to use ([A-Za-z0-9_:\-]+(?:\([^)]*\))?) (?:was|has been) denied")
        .expect("permission pattern is valid")
});

static DONE_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(all (?:tasks|items|work) (?:are |is )?(?:now )?(?:complete|completed|done|finished)|project (?:is )?(?:now )?(?:complete|completed|done|finished)|nothing (?:left|remaining) to (?:do|implement)|no (?:remaining|more) (?:tasks|work))\b",
    )
    .expect("done signal pattern is valid")
});

/// Quota phrases in the agent's own error channel (error results and events).
static API_QUOTA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(usage limit|rate limit|rate_limit_error|quota exceeded|5-hour limit|too many requests|\b429\b)",
    )
    .expect("quota pattern is valid")
});

/// Quota report on a plain (stderr or text-mode) line. Anchored at the line
/// start so prose and compiler diagnostics that merely mention a limit do not
/// match.
static API_QUOTA_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*(claude ai usage limit reached|(api error|http)\W*429\b|429\s+too many requests|(api\s+)?error\b[^\n]*?\b(usage limit|rate limit(ed)?|quota exceeded|5-hour limit|too many requests)\b)",
    )
    .expect("quota line pattern is valid")
});

static TEST_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(cargo test|npm (?:run )?test|pytest|go test|bats |jest|running (?:the )?tests|ran (?:the )?tests)",
    )
    .expect("test command pattern is valid")
});

static IMPLEMENTATION_WORK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(implement\w*|creat\w*|add(?:ed|ing)?|fix\w*|refactor\w*|wrote|writ\w*|modif\w*|updat\w*)\b")
        .expect("implementation pattern is valid")
});

/// Work category reported in the status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkType {
    Implementation,
    Testing,
    Documentation,
    Refactoring,
    Other,
}

impl WorkType {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "IMPLEMENTATION" => WorkType::Implementation,
            "TESTING" => WorkType::Testing,
            "DOCUMENTATION" => WorkType::Documentation,
            "REFACTORING" => WorkType::Refactoring,
            _ => WorkType::Other,
        }
    }
}

/// Fields of the `---RALPH_STATUS---` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusBlock {
    pub status: Option<String>,
    pub exit_signal: bool,
    pub work_type: Option<WorkType>,
    pub files_modified: Option<u32>,
    pub recommendation: Option<String>,
}

impl StatusBlock {
    /// Parse the last status block in `text`, if any.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let start = text.rfind(STATUS_BLOCK_START)?;
        let body = &text[start + STATUS_BLOCK_START.len()..];
        let body = match body.find(STATUS_BLOCK_END) {
            Some(end) => &body[..end],
            None => return None,
        };

        let mut block = StatusBlock::default();
        for line in body.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_uppercase().as_str() {
                "STATUS" => block.status = Some(value.to_ascii_uppercase()),
                "EXIT_SIGNAL" => block.exit_signal = value.eq_ignore_ascii_case("true"),
                "WORK_TYPE" => block.work_type = Some(WorkType::parse(value)),
                "FILES_MODIFIED" => block.files_modified = value.parse().ok(),
                "RECOMMENDATION" if !value.is_empty() => {
                    block.recommendation = Some(value.to_string());
                }
                _ => {}
            }
        }
        Some(block)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("COMPLETE")
    }
}

/// Everything extracted from one agent run's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSignals {
    /// Denied tools or commands, in the order reported.
    pub permission_denials: Vec<String>,
    pub test_only: bool,
    pub done_signal: bool,
    /// `STATUS: COMPLETE` in the status block.
    pub completion_indicator: bool,
    /// `EXIT_SIGNAL: true` in the status block.
    pub exit_signal: bool,
    pub has_errors: bool,
    pub error_signature: Option<String>,
    pub continuity_token: Option<String>,
    pub work_summary: Option<String>,
    /// Heuristic 0-100; diagnostics only.
    pub confidence_score: u32,
    pub api_quota_exceeded: bool,
    pub files_modified: Option<u32>,
    pub output_length: usize,
}

impl OutputSignals {
    #[must_use]
    pub fn has_permission_denials(&self) -> bool {
        !self.permission_denials.is_empty()
    }
}

/// Text and metadata collected from the raw output.
#[derive(Debug, Default)]
struct Extracted {
    text: String,
    /// Error results and error events reported by the agent itself.
    errors: String,
    /// Lines that were not JSON events: stderr, or the whole text output.
    plain: String,
    session_id: Option<String>,
    is_error: bool,
    denials: Vec<String>,
}

fn push_line(buf: &mut String, line: &str) {
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
}

impl Extracted {
    fn push_text(&mut self, text: &str) {
        push_line(&mut self.text, text);
    }

    fn push_error(&mut self, error: &Value) {
        match error {
            Value::String(message) => push_line(&mut self.errors, message),
            Value::Null => {}
            other => push_line(&mut self.errors, &other.to_string()),
        }
    }

    fn absorb_event(&mut self, event: &Value) {
        if let Some(id) = event.get("session_id").and_then(Value::as_str) {
            if !id.is_empty() {
                self.session_id = Some(id.to_string());
            }
        }

        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let content = event
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten();
                for part in content {
                    if part.get("type").and_then(Value::as_str) == Some("text") {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            self.push_text(text);
                        }
                    }
                }
            }
            Some("result") | None => {
                let is_error = event.get("is_error").and_then(Value::as_bool) == Some(true);
                if let Some(result) = event.get("result").and_then(Value::as_str) {
                    self.push_text(result);
                    if is_error {
                        push_line(&mut self.errors, result);
                    }
                }
                if is_error {
                    self.is_error = true;
                }
                if let Some(error) = event.get("error") {
                    self.push_error(error);
                }
                if let Some(denials) = event.get("permission_denials").and_then(Value::as_array) {
                    self.denials.extend(denials.iter().map(describe_denial));
                }
            }
            Some("error") => {
                self.is_error = true;
                if let Some(error) = event.get("error") {
                    self.push_error(error);
                }
            }
            _ => {}
        }
    }
}

fn describe_denial(denial: &Value) -> String {
    let tool = denial
        .get("tool_name")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    match denial.pointer("/tool_input/command").and_then(Value::as_str) {
        Some(command) => format!("{tool}({command})"),
        None => tool.to_string(),
    }
}

fn extract(raw: &str) -> Extracted {
    let mut extracted = Extracted::default();

    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
            extracted.absorb_event(&value);
            return extracted;
        }
    }

    for line in raw.lines() {
        let candidate = line.trim();
        if candidate.starts_with('{') {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
                extracted.absorb_event(&value);
                continue;
            }
        }
        extracted.push_text(line);
        push_line(&mut extracted.plain, line);
    }
    extracted
}

/// Quota exhaustion reported by the agent, never by tool output it relays.
fn quota_exceeded(extracted: &Extracted) -> bool {
    API_QUOTA.is_match(&extracted.errors) || API_QUOTA_LINE.is_match(&extracted.plain)
}

fn summarize(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("---"))
        .map(|line| line.chars().take(MAX_SUMMARY_LEN).collect())
}

fn looks_test_only(text: &str) -> bool {
    TEST_COMMAND.is_match(text) && !IMPLEMENTATION_WORK.is_match(text)
}

/// Classify the raw output of one agent run.
///
/// # Example
///
/// ```
/// use ralph_loop::signals::analyze_output;
///
/// let output = "Done.\n---RALPH_STATUS---\nSTATUS: COMPLETE\nEXIT_SIGNAL: true\n---END_RALPH_STATUS---";
/// let signals = analyze_output(output);
/// assert!(signals.completion_indicator);
/// assert!(signals.exit_signal);
/// ```
#[must_use]
pub fn analyze_output(raw: &str) -> OutputSignals {
    let extracted = extract(raw);
    let api_quota_exceeded = quota_exceeded(&extracted);
    let text = extracted.text.as_str();
    let block = StatusBlock::parse(text);

    let mut permission_denials = extracted.denials;
    if permission_denials.is_empty() {
        permission_denials.extend(
            PERMISSION_DENIED_TEXT
                .captures_iter(text)
                .map(|caps| caps[1].to_string()),
        );
    }

    let test_only = match block.as_ref().and_then(|b| b.work_type) {
        Some(work_type) => work_type == WorkType::Testing,
        None => looks_test_only(text),
    };
    let completion_indicator = block.as_ref().is_some_and(StatusBlock::is_complete);
    let exit_signal = block.as_ref().is_some_and(|b| b.exit_signal);
    let done_signal = DONE_SIGNAL.is_match(text);
    let has_errors = extracted.is_error || error_lines(text).next().is_some();

    let mut confidence_score = 0;
    if block.is_some() {
        confidence_score += 10;
    }
    if completion_indicator {
        confidence_score += 40;
    }
    if exit_signal {
        confidence_score += 30;
    }
    if done_signal {
        confidence_score += 20;
    }

    OutputSignals {
        permission_denials,
        test_only,
        done_signal,
        completion_indicator,
        exit_signal,
        has_errors,
        error_signature: error_signature(text),
        continuity_token: extracted.session_id,
        work_summary: block
            .as_ref()
            .and_then(|b| b.recommendation.clone())
            .or_else(|| summarize(text)),
        confidence_score: confidence_score.min(100),
        api_quota_exceeded,
        files_modified: block.and_then(|b| b.files_modified),
        output_length: raw.len(),
    }
}
