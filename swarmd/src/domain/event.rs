//! Agent events: the ingested structured output stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed taxonomy for ingested agent events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    System,
    Assistant,
    ToolUse,
    User,
    Result,
    Error,
    RateLimitEvent,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::ToolUse => "tool_use",
            Self::User => "user",
            Self::Result => "result",
            Self::Error => "error",
            Self::RateLimitEvent => "rate_limit_event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "assistant" => Some(Self::Assistant),
            "tool_use" => Some(Self::ToolUse),
            "user" => Some(Self::User),
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            "rate_limit_event" => Some(Self::RateLimitEvent),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One appended event; `id` establishes the canonical per-agent sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: i64,
    pub agent_id: String,
    pub event_type: EventType,
    /// Opaque original payload
    pub event_data: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for ty in [
            EventType::System,
            EventType::Assistant,
            EventType::ToolUse,
            EventType::User,
            EventType::Result,
            EventType::Error,
            EventType::RateLimitEvent,
        ] {
            assert_eq!(EventType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(EventType::parse("unknown"), None);
    }
}
