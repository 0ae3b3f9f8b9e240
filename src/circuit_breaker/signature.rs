//! Error-line detection and signature normalization.
//!
//! Two failures are "the same error" when their first error line normalizes
//! to the same signature: surrounding whitespace dropped, digit runs (line
//! numbers, counters, timestamps) collapsed to `#`, length capped.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum signature length in characters.
pub const MAX_SIGNATURE_LEN: usize = 200;

// Must not match `"is_error":false` in JSON result events.
static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(^\s*(error|fatal|exception|traceback)\b|error(\[[a-z]?\d+\])?:|panicked at|^\s*failed\b|(?-i:\bFAILED\b))",
    )
    .expect("error line pattern is valid")
});

static DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("digit pattern is valid"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Whether a single line looks like an error report.
#[must_use]
pub fn is_error_line(line: &str) -> bool {
    ERROR_LINE.is_match(line)
}

/// Lines of `output` that look like error reports.
pub fn error_lines(output: &str) -> impl Iterator<Item = &str> {
    output.lines().filter(|line| is_error_line(line))
}

/// Normalized signature of the first error line, if any.
///
/// # Example
///
/// ```
/// use ralph_loop::circuit_breaker::error_signature;
///
/// let a = error_signature("ok\nerror[E0308]: mismatched types at src/lib.rs:12");
/// let b = error_signature("error[E0308]: mismatched types at src/lib.rs:40");
/// assert_eq!(a, b);
/// ```
#[must_use]
pub fn error_signature(output: &str) -> Option<String> {
    error_lines(output).next().map(normalize)
}

fn normalize(line: &str) -> String {
    let collapsed = DIGITS.replace_all(line.trim(), "#");
    let collapsed = WHITESPACE.replace_all(&collapsed, " ");
    collapsed.chars().take(MAX_SIGNATURE_LEN).collect()
}
