//! StateManager - actor that owns the SQLite store
//!
//! Processes commands via channels. Cloning the handle is cheap; every
//! component talks to the same single-writer actor.

use std::path::Path;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::domain::{
    AgentEvent, AgentRun, AgentRunStatus, EventType, IterationStatus, ReviewIteration, WorkItem, WorkItemStatus,
};

use super::db::{Store, StoreMetrics};
use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to send commands to the StateManager actor
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Open the store and spawn the actor task
    pub fn spawn(db_path: impl AsRef<Path>) -> Result<Self, StateError> {
        let store = Store::open(db_path.as_ref())?;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!(db_path = %db_path.as_ref().display(), "StateManager spawned");
        Ok(Self { tx })
    }

    /// Ask the actor to stop. Pending commands ahead of this one still run.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StateCommand::Shutdown).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| StateError::ChannelClosed)?;
        rx.await.map_err(|_| StateError::ChannelClosed)?
    }

    // === Work items ===

    pub async fn upsert_work_item(&self, number: i64, title: &str, body: &str) -> StateResponse<WorkItem> {
        let (title, body) = (title.to_string(), body.to_string());
        self.request(|reply| StateCommand::UpsertWorkItem {
            number,
            title,
            body,
            reply,
        })
        .await
    }

    pub async fn seed_pr_created(&self, number: i64, title: &str, body: &str, pr_number: i64) -> StateResponse<WorkItem> {
        let (title, body) = (title.to_string(), body.to_string());
        self.request(|reply| StateCommand::SeedPrCreated {
            number,
            title,
            body,
            pr_number,
            reply,
        })
        .await
    }

    pub async fn claim_work_item(&self, number: i64, agent_id: &str) -> StateResponse<bool> {
        let agent_id = agent_id.to_string();
        self.request(|reply| StateCommand::ClaimWorkItem { number, agent_id, reply })
            .await
    }

    pub async fn record_pr_created(&self, number: i64, pr_number: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::RecordPrCreated {
            number,
            pr_number,
            reply,
        })
        .await
    }

    pub async fn record_resolved(&self, number: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::RecordResolved { number, reply }).await
    }

    pub async fn record_needs_human(&self, number: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::RecordNeedsHuman { number, reply })
            .await
    }

    pub async fn reset_to_pending(&self, number: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::ResetToPending { number, reply }).await
    }

    pub async fn uncount_attempt(&self, number: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::UncountAttempt { number, reply }).await
    }

    pub async fn recount_attempt(&self, number: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::RecountAttempt { number, reply }).await
    }

    pub async fn get_work_item(&self, number: i64) -> StateResponse<Option<WorkItem>> {
        self.request(|reply| StateCommand::GetWorkItem { number, reply }).await
    }

    pub async fn list_work_items(&self, status: Option<WorkItemStatus>) -> StateResponse<Vec<WorkItem>> {
        self.request(|reply| StateCommand::ListWorkItems { status, reply }).await
    }

    // === Agent runs ===

    pub async fn create_agent_run(&self, run: AgentRun) -> StateResponse<()> {
        self.request(|reply| StateCommand::CreateAgentRun {
            run: Box::new(run),
            reply,
        })
        .await
    }

    pub async fn record_agent_status(
        &self,
        agent_id: &str,
        status: AgentRunStatus,
        error: Option<&str>,
    ) -> StateResponse<bool> {
        let agent_id = agent_id.to_string();
        let error = error.map(|e| e.to_string());
        self.request(|reply| StateCommand::RecordAgentStatus {
            agent_id,
            status,
            error,
            reply,
        })
        .await
    }

    pub async fn record_agent_session(&self, agent_id: &str, session_id: &str) -> StateResponse<()> {
        let (agent_id, session_id) = (agent_id.to_string(), session_id.to_string());
        self.request(|reply| StateCommand::RecordAgentSession {
            agent_id,
            session_id,
            reply,
        })
        .await
    }

    pub async fn record_agent_pid(&self, agent_id: &str, pid: u32) -> StateResponse<()> {
        let agent_id = agent_id.to_string();
        self.request(|reply| StateCommand::RecordAgentPid { agent_id, pid, reply })
            .await
    }

    pub async fn record_rate_limited(&self, agent_id: &str) -> StateResponse<bool> {
        let agent_id = agent_id.to_string();
        self.request(|reply| StateCommand::RecordRateLimited { agent_id, reply })
            .await
    }

    pub async fn increment_rate_limit_hits(&self, agent_id: &str) -> StateResponse<()> {
        let agent_id = agent_id.to_string();
        self.request(|reply| StateCommand::IncrementRateLimitHits { agent_id, reply })
            .await
    }

    pub async fn get_agent_run(&self, agent_id: &str) -> StateResponse<Option<AgentRun>> {
        let agent_id = agent_id.to_string();
        self.request(|reply| StateCommand::GetAgentRun { agent_id, reply }).await
    }

    pub async fn list_agent_runs(&self, status: Option<AgentRunStatus>) -> StateResponse<Vec<AgentRun>> {
        self.request(|reply| StateCommand::ListAgentRuns { status, reply }).await
    }

    pub async fn list_active_runs(&self) -> StateResponse<Vec<AgentRun>> {
        self.request(|reply| StateCommand::ListActiveRuns { reply }).await
    }

    pub async fn list_rate_limited_runs(&self) -> StateResponse<Vec<AgentRun>> {
        self.request(|reply| StateCommand::ListRateLimitedRuns { reply }).await
    }

    pub async fn count_running(&self) -> StateResponse<u32> {
        self.request(|reply| StateCommand::CountRunning { reply }).await
    }

    pub async fn active_run_for_work_item(&self, number: i64) -> StateResponse<Option<AgentRun>> {
        self.request(|reply| StateCommand::ActiveRunForWorkItem { number, reply })
            .await
    }

    pub async fn active_run_for_pr(&self, pr_number: i64) -> StateResponse<Option<AgentRun>> {
        self.request(|reply| StateCommand::ActiveRunForPr { pr_number, reply })
            .await
    }

    // === Events ===

    pub async fn append_event(&self, agent_id: &str, event_type: EventType, data: &str) -> StateResponse<i64> {
        let (agent_id, data) = (agent_id.to_string(), data.to_string());
        self.request(|reply| StateCommand::AppendEvent {
            agent_id,
            event_type,
            data,
            reply,
        })
        .await
    }

    pub async fn list_events(&self, agent_id: &str, since: i64) -> StateResponse<Vec<AgentEvent>> {
        let agent_id = agent_id.to_string();
        self.request(|reply| StateCommand::ListEvents { agent_id, since, reply })
            .await
    }

    // === Review iterations ===

    pub async fn upsert_review_iteration(
        &self,
        pr_number: i64,
        iteration: u32,
        comments_count: u32,
        comments_json: Option<String>,
    ) -> StateResponse<i64> {
        self.request(|reply| StateCommand::UpsertReviewIteration {
            pr_number,
            iteration,
            comments_count,
            comments_json,
            reply,
        })
        .await
    }

    pub async fn link_fix_agent(&self, iteration_id: i64, agent_id: &str) -> StateResponse<()> {
        let agent_id = agent_id.to_string();
        self.request(|reply| StateCommand::LinkFixAgent {
            iteration_id,
            agent_id,
            reply,
        })
        .await
    }

    pub async fn record_iteration_status(&self, iteration_id: i64, status: IterationStatus) -> StateResponse<()> {
        self.request(|reply| StateCommand::RecordIterationStatus {
            iteration_id,
            status,
            reply,
        })
        .await
    }

    pub async fn list_iterations(&self, pr_number: Option<i64>) -> StateResponse<Vec<ReviewIteration>> {
        self.request(|reply| StateCommand::ListIterations { pr_number, reply })
            .await
    }

    pub async fn count_iterations(&self, pr_number: i64) -> StateResponse<u32> {
        self.request(|reply| StateCommand::CountIterations { pr_number, reply })
            .await
    }

    pub async fn latest_iteration(&self, pr_number: i64) -> StateResponse<Option<ReviewIteration>> {
        self.request(|reply| StateCommand::LatestIteration { pr_number, reply })
            .await
    }

    // === Aggregates ===

    pub async fn metrics(&self) -> StateResponse<StoreMetrics> {
        self.request(|reply| StateCommand::Metrics { reply }).await
    }
}

/// The actor: owns the connection, drains the channel, replies per command
async fn actor_loop(store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("state actor started");
    while let Some(command) = rx.recv().await {
        match command {
            StateCommand::UpsertWorkItem {
                number,
                title,
                body,
                reply,
            } => {
                let _ = reply.send(store.upsert_work_item(number, &title, &body));
            }
            StateCommand::SeedPrCreated {
                number,
                title,
                body,
                pr_number,
                reply,
            } => {
                let _ = reply.send(store.seed_pr_created(number, &title, &body, pr_number));
            }
            StateCommand::ClaimWorkItem { number, agent_id, reply } => {
                let _ = reply.send(store.claim_work_item(number, &agent_id));
            }
            StateCommand::RecordPrCreated {
                number,
                pr_number,
                reply,
            } => {
                let _ = reply.send(store.record_pr_created(number, pr_number));
            }
            StateCommand::RecordResolved { number, reply } => {
                let _ = reply.send(store.record_resolved(number));
            }
            StateCommand::RecordNeedsHuman { number, reply } => {
                let _ = reply.send(store.record_needs_human(number));
            }
            StateCommand::ResetToPending { number, reply } => {
                let _ = reply.send(store.reset_to_pending(number));
            }
            StateCommand::UncountAttempt { number, reply } => {
                let _ = reply.send(store.uncount_attempt(number));
            }
            StateCommand::RecountAttempt { number, reply } => {
                let _ = reply.send(store.recount_attempt(number));
            }
            StateCommand::GetWorkItem { number, reply } => {
                let _ = reply.send(store.get_work_item(number));
            }
            StateCommand::ListWorkItems { status, reply } => {
                let _ = reply.send(store.list_work_items(status));
            }
            StateCommand::CreateAgentRun { run, reply } => {
                let _ = reply.send(store.create_agent_run(&run));
            }
            StateCommand::RecordAgentStatus {
                agent_id,
                status,
                error,
                reply,
            } => {
                let _ = reply.send(store.record_agent_status(&agent_id, status, error.as_deref()));
            }
            StateCommand::RecordAgentSession {
                agent_id,
                session_id,
                reply,
            } => {
                let _ = reply.send(store.record_agent_session(&agent_id, &session_id));
            }
            StateCommand::RecordAgentPid { agent_id, pid, reply } => {
                let _ = reply.send(store.record_agent_pid(&agent_id, pid));
            }
            StateCommand::RecordRateLimited { agent_id, reply } => {
                let _ = reply.send(store.record_rate_limited(&agent_id));
            }
            StateCommand::IncrementRateLimitHits { agent_id, reply } => {
                let _ = reply.send(store.increment_rate_limit_hits(&agent_id));
            }
            StateCommand::GetAgentRun { agent_id, reply } => {
                let _ = reply.send(store.get_agent_run(&agent_id));
            }
            StateCommand::ListAgentRuns { status, reply } => {
                let _ = reply.send(store.list_agent_runs(status));
            }
            StateCommand::ListActiveRuns { reply } => {
                let _ = reply.send(store.list_active_runs());
            }
            StateCommand::ListRateLimitedRuns { reply } => {
                let _ = reply.send(store.list_rate_limited_runs());
            }
            StateCommand::CountRunning { reply } => {
                let _ = reply.send(store.count_running());
            }
            StateCommand::ActiveRunForWorkItem { number, reply } => {
                let _ = reply.send(store.active_run_for_work_item(number));
            }
            StateCommand::ActiveRunForPr { pr_number, reply } => {
                let _ = reply.send(store.active_run_for_pr(pr_number));
            }
            StateCommand::AppendEvent {
                agent_id,
                event_type,
                data,
                reply,
            } => {
                let _ = reply.send(store.append_event(&agent_id, event_type, &data));
            }
            StateCommand::ListEvents { agent_id, since, reply } => {
                let _ = reply.send(store.list_events(&agent_id, since));
            }
            StateCommand::UpsertReviewIteration {
                pr_number,
                iteration,
                comments_count,
                comments_json,
                reply,
            } => {
                let _ = reply.send(store.upsert_review_iteration(
                    pr_number,
                    iteration,
                    comments_count,
                    comments_json.as_deref(),
                ));
            }
            StateCommand::LinkFixAgent {
                iteration_id,
                agent_id,
                reply,
            } => {
                let _ = reply.send(store.link_fix_agent(iteration_id, &agent_id));
            }
            StateCommand::RecordIterationStatus {
                iteration_id,
                status,
                reply,
            } => {
                let _ = reply.send(store.record_iteration_status(iteration_id, status));
            }
            StateCommand::ListIterations { pr_number, reply } => {
                let _ = reply.send(store.list_iterations(pr_number));
            }
            StateCommand::CountIterations { pr_number, reply } => {
                let _ = reply.send(store.count_iterations(pr_number));
            }
            StateCommand::LatestIteration { pr_number, reply } => {
                let _ = reply.send(store.latest_iteration(pr_number));
            }
            StateCommand::Metrics { reply } => {
                let _ = reply.send(store.metrics());
            }
            StateCommand::Shutdown => {
                debug!("state actor: shutdown command received");
                break;
            }
        }
    }
    info!("state actor stopped");
}
