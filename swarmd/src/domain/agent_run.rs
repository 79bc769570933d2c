//! Agent runs: one invocation of the agent program

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an agent run was dispatched to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Implement an issue and open a pull request
    Implement,
    /// Address review feedback on an existing pull request
    FixReview,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::FixReview => "fix_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "implement" => Some(Self::Implement),
            "fix_review" => Some(Self::FixReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of an agent run
///
/// Transitions: `running -> {completed, failed, timeout, rate_limited}` and
/// `rate_limited -> resumed` when a successor run is spawned in the preserved
/// worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    RateLimited,
    Resumed,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Resumed => "resumed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "rate_limited" => Some(Self::RateLimited),
            "resumed" => Some(Self::Resumed),
            _ => None,
        }
    }

    /// Statuses that hold the per-item exclusivity slot. Rate-limited runs
    /// keep their identity and worktree but release the global capacity slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::RateLimited)
    }
}

impl std::fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One invocation of the agent program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    /// Unique per run, e.g. `agent-issue-42-attempt-1`
    pub agent_id: String,
    /// Set for implement runs
    pub work_item_number: Option<i64>,
    /// Set for fix runs (and implement runs once a PR exists)
    pub pr_number: Option<i64>,
    pub kind: AgentKind,
    pub status: AgentRunStatus,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    /// OS process id while running; kept for crash recovery
    pub pid: Option<u32>,
    /// Continuation token discovered in the event stream
    pub session_id: Option<String>,
    /// How many times this lineage has been resumed after a rate limit
    pub resume_count: u32,
    pub rate_limited_at: Option<DateTime<Utc>>,
    /// Stderr rate-limit signature hits, surfaced so heuristic drift is observable
    pub rate_limit_hits: u32,
    /// Count of `assistant` events, filled in by the store on read
    pub turns_used: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl AgentRun {
    /// A fresh running row for a newly spawned agent
    pub fn new_running(agent_id: String, kind: AgentKind) -> Self {
        Self {
            agent_id,
            work_item_number: None,
            pr_number: None,
            kind,
            status: AgentRunStatus::Running,
            worktree_path: None,
            branch_name: None,
            pid: None,
            session_id: None,
            resume_count: 0,
            rate_limited_at: None,
            rate_limit_hits: 0,
            turns_used: 0,
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
        }
    }
}

/// Agent id for the k-th implement attempt on an issue
pub fn implement_agent_id(issue_number: i64, attempt: u32) -> String {
    format!("agent-issue-{issue_number}-attempt-{attempt}")
}

/// Agent id for the k-th fix iteration on a PR
pub fn fix_agent_id(pr_number: i64, iteration: u32) -> String {
    format!("agent-fix-{pr_number}-iter-{iteration}")
}
