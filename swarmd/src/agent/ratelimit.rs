//! Rate-limit signature detection
//!
//! Matched against both the agent's stderr stream and error events. The list
//! is a fixed best-effort heuristic; every hit is counted on the run so
//! false-positive drift shows up in the dashboard.

/// Case-insensitive substrings that signal an upstream rate limit
pub const RATE_LIMIT_SIGNATURES: &[&str] = &["rate limit", "429", "too many requests", "overloaded", "usage limit"];

/// True when the line carries a rate-limit signature
pub fn matches(line: &str) -> bool {
    let lower = line.to_lowercase();
    RATE_LIMIT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_match_case_insensitively() {
        assert!(matches("Error: Rate Limit exceeded"));
        assert!(matches("HTTP 429 from upstream"));
        assert!(matches("too many requests, slow down"));
        assert!(matches("api_error: Overloaded"));
        assert!(matches("You have hit your usage limit for today"));
    }

    #[test]
    fn test_ordinary_lines_do_not_match() {
        assert!(!matches("compiling swarmd v0.1.0"));
        assert!(!matches("test result: ok. 42 passed"));
        assert!(!matches(""));
    }
}
