//! State store messages
//!
//! Commands and responses for the actor pattern. Every mutation and query
//! goes through one channel, which is what serializes writers.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{
    AgentEvent, AgentRun, AgentRunStatus, EventType, IterationStatus, ReviewIteration, WorkItem, WorkItemStatus,
};

use super::db::StoreMetrics;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state channel closed")]
    ChannelClosed,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Work item operations
    UpsertWorkItem {
        number: i64,
        title: String,
        body: String,
        reply: oneshot::Sender<StateResponse<WorkItem>>,
    },
    SeedPrCreated {
        number: i64,
        title: String,
        body: String,
        pr_number: i64,
        reply: oneshot::Sender<StateResponse<WorkItem>>,
    },
    ClaimWorkItem {
        number: i64,
        agent_id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    RecordPrCreated {
        number: i64,
        pr_number: i64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    RecordResolved {
        number: i64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    RecordNeedsHuman {
        number: i64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ResetToPending {
        number: i64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    UncountAttempt {
        number: i64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    RecountAttempt {
        number: i64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetWorkItem {
        number: i64,
        reply: oneshot::Sender<StateResponse<Option<WorkItem>>>,
    },
    ListWorkItems {
        status: Option<WorkItemStatus>,
        reply: oneshot::Sender<StateResponse<Vec<WorkItem>>>,
    },

    // Agent run operations
    CreateAgentRun {
        run: Box<AgentRun>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    RecordAgentStatus {
        agent_id: String,
        status: AgentRunStatus,
        error: Option<String>,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    RecordAgentSession {
        agent_id: String,
        session_id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    RecordAgentPid {
        agent_id: String,
        pid: u32,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    RecordRateLimited {
        agent_id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    IncrementRateLimitHits {
        agent_id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetAgentRun {
        agent_id: String,
        reply: oneshot::Sender<StateResponse<Option<AgentRun>>>,
    },
    ListAgentRuns {
        status: Option<AgentRunStatus>,
        reply: oneshot::Sender<StateResponse<Vec<AgentRun>>>,
    },
    ListActiveRuns {
        reply: oneshot::Sender<StateResponse<Vec<AgentRun>>>,
    },
    ListRateLimitedRuns {
        reply: oneshot::Sender<StateResponse<Vec<AgentRun>>>,
    },
    CountRunning {
        reply: oneshot::Sender<StateResponse<u32>>,
    },
    ActiveRunForWorkItem {
        number: i64,
        reply: oneshot::Sender<StateResponse<Option<AgentRun>>>,
    },
    ActiveRunForPr {
        pr_number: i64,
        reply: oneshot::Sender<StateResponse<Option<AgentRun>>>,
    },

    // Event operations (append-only)
    AppendEvent {
        agent_id: String,
        event_type: EventType,
        data: String,
        reply: oneshot::Sender<StateResponse<i64>>,
    },
    ListEvents {
        agent_id: String,
        since: i64,
        reply: oneshot::Sender<StateResponse<Vec<AgentEvent>>>,
    },

    // Review iteration operations
    UpsertReviewIteration {
        pr_number: i64,
        iteration: u32,
        comments_count: u32,
        comments_json: Option<String>,
        reply: oneshot::Sender<StateResponse<i64>>,
    },
    LinkFixAgent {
        iteration_id: i64,
        agent_id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    RecordIterationStatus {
        iteration_id: i64,
        status: IterationStatus,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListIterations {
        pr_number: Option<i64>,
        reply: oneshot::Sender<StateResponse<Vec<ReviewIteration>>>,
    },
    CountIterations {
        pr_number: i64,
        reply: oneshot::Sender<StateResponse<u32>>,
    },
    LatestIteration {
        pr_number: i64,
        reply: oneshot::Sender<StateResponse<Option<ReviewIteration>>>,
    },

    // Aggregates
    Metrics {
        reply: oneshot::Sender<StateResponse<StoreMetrics>>,
    },

    // Shutdown
    Shutdown,
}
