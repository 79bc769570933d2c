//! Event classification and extraction
//!
//! Each line of agent stdout is one JSON payload. Classification maps the
//! declared type onto the fixed taxonomy; extraction pulls out the session
//! id, PR numbers from result events, and a short inline summary of
//! assistant turns.

use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::EventType;

/// A classified line from the agent's stdout
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_type: EventType,
    /// Continuation token, carried on any event
    pub session_id: Option<String>,
    /// Short inline summary for assistant events
    pub summary: Option<String>,
    /// PR number advertised by a result event
    pub pr_number: Option<i64>,
    /// True when the PR number came from the regex fallback, not the payload
    pub pr_via_fallback: bool,
    /// The original payload, stored verbatim
    pub raw: String,
}

/// Classify one stdout line
///
/// Parse failures become synthetic error events carrying the raw text.
pub fn classify(line: &str) -> ParsedEvent {
    let json: Value = match serde_json::from_str(line) {
        Ok(json) => json,
        Err(e) => {
            debug!(error = %e, "classify: unparseable event line");
            return ParsedEvent {
                event_type: EventType::Error,
                session_id: None,
                summary: None,
                pr_number: None,
                pr_via_fallback: false,
                raw: line.to_string(),
            };
        }
    };

    let declared = json.get("type").and_then(Value::as_str).unwrap_or("");
    let event_type = EventType::parse(declared).unwrap_or_else(|| {
        debug!(declared, "classify: unknown event type, recording as system");
        EventType::System
    });

    let session_id = json.get("session_id").and_then(Value::as_str).map(str::to_string);

    let (pr_number, pr_via_fallback) = if event_type == EventType::Result {
        extract_pr_number(&json)
    } else {
        (None, false)
    };

    let summary = if event_type == EventType::Assistant {
        summarize_assistant(&json)
    } else {
        None
    };

    ParsedEvent {
        event_type,
        session_id,
        summary,
        pr_number,
        pr_via_fallback,
        raw: line.to_string(),
    }
}

/// PR number from a result event: structured payload field first, then a
/// regex over the result text. The fallback path logs a warning so format
/// drift in the agent's output is visible.
pub fn extract_pr_number(json: &Value) -> (Option<i64>, bool) {
    if let Some(number) = json.get("pr_number").and_then(Value::as_i64) {
        return (Some(number), false);
    }
    if let Some(url) = json.get("pr_url").and_then(Value::as_str)
        && let Some(number) = crate::github::parse_pr_url(url)
    {
        return (Some(number), false);
    }

    let text = json.get("result").and_then(Value::as_str).unwrap_or("");
    if let Some(number) = crate::github::parse_pr_url(text) {
        warn!(number, "PR number recovered from result text URL, not the structured payload");
        return (Some(number), true);
    }
    if text.to_lowercase().contains("pr create")
        && let Some(number) = last_hash_number(text)
    {
        warn!(number, "PR number recovered via #N regex fallback");
        return (Some(number), true);
    }
    (None, false)
}

fn last_hash_number(text: &str) -> Option<i64> {
    let re = regex::Regex::new(r"#(\d+)").ok()?;
    re.captures_iter(text).last()?.get(1)?.as_str().parse().ok()
}

/// Inline summary of an assistant turn: tool uses, thinking, leading text
fn summarize_assistant(json: &Value) -> Option<String> {
    let blocks = json.pointer("/message/content")?.as_array()?;
    let mut parts = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                let input = block.get("input").unwrap_or(&Value::Null);
                parts.push(summarize_tool_use(name, input));
            }
            Some("thinking") => parts.push("[thinking]".to_string()),
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        parts.push(truncate(trimmed, 80));
                    }
                }
            }
            _ => {}
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(truncate(&parts.join(" "), 200))
    }
}

fn summarize_tool_use(name: &str, input: &Value) -> String {
    match name {
        "Bash" => {
            let command = input.get("command").and_then(Value::as_str).unwrap_or("");
            format!("[$ {}]", truncate(command, 60))
        }
        "Read" | "Write" | "Edit" => {
            let path = input.get("file_path").and_then(Value::as_str).unwrap_or("");
            format!("[{name} {path}]")
        }
        "Skill" => {
            let skill = input
                .get("skill")
                .or_else(|| input.get("command"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            format!("[Capability: {skill}]")
        }
        other => format!("[{other}]"),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_types() {
        let event = classify(r#"{"type":"system","subtype":"init","session_id":"sess-1"}"#);
        assert_eq!(event.event_type, EventType::System);
        assert_eq!(event.session_id.as_deref(), Some("sess-1"));

        let event = classify(r#"{"type":"assistant","message":{"content":[]}}"#);
        assert_eq!(event.event_type, EventType::Assistant);

        let event = classify(r#"{"type":"rate_limit_event"}"#);
        assert_eq!(event.event_type, EventType::RateLimitEvent);
    }

    #[test]
    fn test_classify_parse_failure_is_synthetic_error() {
        let event = classify("this is not json");
        assert_eq!(event.event_type, EventType::Error);
        assert_eq!(event.raw, "this is not json");
    }

    #[test]
    fn test_classify_unknown_type() {
        let event = classify(r#"{"type":"telemetry"}"#);
        assert_eq!(event.event_type, EventType::System);
    }

    #[test]
    fn test_pr_number_structured_field() {
        let json: Value = serde_json::from_str(r#"{"type":"result","pr_number":99}"#).unwrap();
        assert_eq!(extract_pr_number(&json), (Some(99), false));
    }

    #[test]
    fn test_pr_number_structured_url() {
        let json: Value =
            serde_json::from_str(r#"{"type":"result","pr_url":"https://github.com/o/r/pull/42"}"#).unwrap();
        assert_eq!(extract_pr_number(&json), (Some(42), false));
    }

    #[test]
    fn test_pr_number_url_in_text_is_fallback() {
        let json: Value = serde_json::from_str(
            r#"{"type":"result","result":"Done. Opened https://github.com/o/r/pull/77 for review."}"#,
        )
        .unwrap();
        assert_eq!(extract_pr_number(&json), (Some(77), true));
    }

    #[test]
    fn test_pr_number_hash_requires_pr_create_context() {
        let json: Value =
            serde_json::from_str(r#"{"type":"result","result":"ran gh pr create, got #55"}"#).unwrap();
        assert_eq!(extract_pr_number(&json), (Some(55), true));

        // A bare #N without the pr create context is not trusted
        let json: Value = serde_json::from_str(r#"{"type":"result","result":"fixed issue #55"}"#).unwrap();
        assert_eq!(extract_pr_number(&json), (None, false));
    }

    #[test]
    fn test_assistant_summary_tool_uses() {
        let event = classify(
            r#"{"type":"assistant","message":{"content":[
                {"type":"thinking","thinking":"hmm"},
                {"type":"tool_use","name":"Bash","input":{"command":"cargo test"}},
                {"type":"tool_use","name":"Read","input":{"file_path":"src/lib.rs"}},
                {"type":"tool_use","name":"Skill","input":{"skill":"changelog"}}
            ]}}"#,
        );
        let summary = event.summary.unwrap();
        assert!(summary.contains("[thinking]"));
        assert!(summary.contains("[$ cargo test]"));
        assert!(summary.contains("[Read src/lib.rs]"));
        assert!(summary.contains("[Capability: changelog]"));
    }

    #[test]
    fn test_assistant_summary_text_is_truncated() {
        let long = "x".repeat(300);
        let line = format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{long}"}}]}}}}"#
        );
        let event = classify(&line);
        let summary = event.summary.unwrap();
        assert!(summary.chars().count() <= 81);
    }
}
