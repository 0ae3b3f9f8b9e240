//! Live-view filter for `stream-json` agent output.

use serde_json::Value;

const MAX_TOOL_INPUT_LEN: usize = 120;

/// Human-readable rendering of one stream-json event.
///
/// Returns `None` for events with nothing worth showing. Lines that are not
/// JSON are passed through unchanged.
///
/// # Example
///
/// ```
/// use ralph_loop::r#loop::stream::filter_stream_line;
///
/// let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Reading files"}]}}"#;
/// assert_eq!(filter_stream_line(line).as_deref(), Some("Reading files"));
/// ```
#[must_use]
pub fn filter_stream_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Ok(event) = serde_json::from_str::<Value>(trimmed) else {
        return Some(trimmed.to_string());
    };

    match event.get("type").and_then(Value::as_str)? {
        "assistant" => {
            let parts: Vec<String> = event
                .pointer("/message/content")
                .and_then(Value::as_array)?
                .iter()
                .filter_map(render_content)
                .collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        "result" => {
            let seconds = event
                .get("duration_ms")
                .and_then(Value::as_u64)
                .map(|ms| ms / 1000)
                .unwrap_or(0);
            let state = if event.get("is_error").and_then(Value::as_bool) == Some(true) {
                "error"
            } else {
                "done"
            };
            Some(format!("[result] {state} after {seconds}s"))
        }
        "system" => event
            .get("subtype")
            .and_then(Value::as_str)
            .filter(|s| *s == "init")
            .map(|_| "[session] started".to_string()),
        _ => None,
    }
}

fn render_content(part: &Value) -> Option<String> {
    match part.get("type").and_then(Value::as_str)? {
        "text" => part
            .get("text")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from),
        "tool_use" => {
            let name = part.get("name").and_then(Value::as_str).unwrap_or("tool");
            let input = part
                .pointer("/input/command")
                .or_else(|| part.pointer("/input/file_path"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let input: String = input.chars().take(MAX_TOOL_INPUT_LEN).collect();
            Some(format!("[tool] {name} {input}").trim_end().to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_use_rendering() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"cargo build"}}]}}"#;
        assert_eq!(
            filter_stream_line(line).as_deref(),
            Some("[tool] Bash cargo build")
        );
    }

    #[test]
    fn test_result_rendering() {
        let line = r#"{"type":"result","is_error":false,"duration_ms":42500,"result":"ok"}"#;
        assert_eq!(
            filter_stream_line(line).as_deref(),
            Some("[result] done after 42s")
        );
    }

    #[test]
    fn test_tool_results_are_hidden() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"..."}]}}"#;
        assert!(filter_stream_line(line).is_none());
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(
            filter_stream_line("  warning: something  ").as_deref(),
            Some("warning: something")
        );
        assert!(filter_stream_line("   ").is_none());
    }
}
