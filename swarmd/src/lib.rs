//! Swarmd - autonomous issue-to-PR agent swarm orchestrator
//!
//! Swarmd watches a GitHub repository for labelled issues, dispatches Claude
//! Code agent subprocesses into isolated git worktrees to implement them, and
//! shepherds the resulting pull requests through review-fix cycles until they
//! are merged or escalated to a human.
//!
//! # Core Concepts
//!
//! - **Durable State**: every work item, agent run, agent event, and review
//!   iteration lives in a single SQLite store; the process can crash and
//!   recover without losing track of detached agents
//! - **Bounded Concurrency**: a hard ceiling on concurrently running agents;
//!   rate-limited agents release their slot and keep their worktree
//! - **Detached Agents**: agent processes outlive orchestrator restarts;
//!   startup recovery reconciles live pids against the store
//! - **Merge-Gated Resolution**: a work item only resolves after the hosting
//!   service reports its pull request merged
//!
//! # Modules
//!
//! - [`store`] - durable state store and startup recovery
//! - [`agent`] - agent pool supervisor: spawn, timeout, rate-limit, resume
//! - [`poller`] - issue discovery loop
//! - [`monitor`] - pull-request review loop
//! - [`events`] - agent event-stream ingestion
//! - [`dashboard`] - read-only HTTP surface

pub mod agent;
pub mod cli;
pub mod config;
pub mod dashboard;
pub mod domain;
pub mod events;
pub mod github;
pub mod monitor;
pub mod poller;
pub mod prompts;
pub mod skills;
pub mod store;
pub mod worktree;

// Re-export commonly used types
pub use agent::{AgentHandle, AgentOutcome, AgentPool, AgentSpawnSpec, DispatchRequest};
pub use config::Config;
pub use domain::{
    AgentEvent, AgentKind, AgentRun, AgentRunStatus, EventType, IterationStatus, ReviewIteration, WorkItem,
    WorkItemStatus,
};
pub use events::{IngestSummary, ParsedEvent};
pub use github::{CheckStatus, GhCli, HostClient, Issue, PullRequest, ReviewThread, ThreadsView};
pub use monitor::PrMonitor;
pub use poller::IssuePoller;
pub use prompts::{FixContext, ImplementContext, PromptBuilder, ResumeContext};
pub use store::{RecoveryStats, StateError, StateManager, StoreMetrics, recover};
pub use worktree::{WorktreeError, WorktreeManager};
