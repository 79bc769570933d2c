//! Review iterations: one observed cycle of the review-fix loop on a PR

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a review iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// Opened, fix agent not yet spawned
    Pending,
    /// A fix agent is working on it
    Fixing,
    /// The fix agent completed
    Fixed,
    /// The fix agent failed or timed out
    Failed,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fixing => "fixing",
            Self::Fixed => "fixed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fixing" => Some(Self::Fixing),
            "fixed" => Some(Self::Fixed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// An iteration in pending or fixing blocks a new one on the same PR
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Fixing)
    }
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One review-fix cycle on a pull request
///
/// `iteration` values per PR are dense from 1; their count is capped by the
/// fix-retry ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIteration {
    pub id: i64,
    pub pr_number: i64,
    /// 1-based position in this PR's review-fix history
    pub iteration: u32,
    /// Unresolved-thread or comment count at dispatch time
    pub comments_count: u32,
    /// Snapshot of unresolved-thread details when thread data was available
    pub comments_json: Option<String>,
    /// Fix agent, once one was spawned for this iteration
    pub agent_id: Option<String>,
    pub status: IterationStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            IterationStatus::Pending,
            IterationStatus::Fixing,
            IterationStatus::Fixed,
            IterationStatus::Failed,
        ] {
            assert_eq!(IterationStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_open_iterations() {
        assert!(IterationStatus::Pending.is_open());
        assert!(IterationStatus::Fixing.is_open());
        assert!(!IterationStatus::Fixed.is_open());
        assert!(!IterationStatus::Failed.is_open());
    }
}
