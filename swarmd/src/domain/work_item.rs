//! Work items: issues in scope for automation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Discovered, waiting for dispatch
    Pending,
    /// An implement agent has claimed it
    InProgress,
    /// A pull request exists; the PR monitor owns it now
    PrCreated,
    /// The pull request was merged on the hosting service
    Resolved,
    /// Retries exhausted; escalated for human attention
    NeedsHuman,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::PrCreated => "pr_created",
            Self::Resolved => "resolved",
            Self::NeedsHuman => "needs_human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "pr_created" => Some(Self::PrCreated),
            "resolved" => Some(Self::Resolved),
            "needs_human" => Some(Self::NeedsHuman),
            _ => None,
        }
    }

    /// Terminal statuses are excluded from future dispatch
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::NeedsHuman)
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An issue tracked for automation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Issue number on the hosting service (primary key)
    pub number: i64,
    pub title: String,
    pub body: String,
    pub status: WorkItemStatus,
    /// Agent currently or last assigned
    pub assigned_agent_id: Option<String>,
    /// Linked pull request, once one exists
    pub pr_number: Option<i64>,
    /// Concluded implement dispatches
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
