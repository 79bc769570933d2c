//! Agent pool supervisor
//!
//! Owns every live agent handle. Dispatch requests arrive from the issue
//! poller and the PR monitor over a channel; the pool enforces the global
//! concurrency ceiling and the one-active-run-per-item invariant, runs the
//! post-completion PR recovery steps, and resumes rate-limited runs when the
//! upstream becomes available again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, eyre};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{AgentKind, AgentRun, AgentRunStatus, IterationStatus, fix_agent_id, implement_agent_id};
use crate::github::{HostClient, ThreadsView};
use crate::prompts::{FixContext, ImplementContext, PromptBuilder, ResumeContext};
use crate::skills;
use crate::store::StateManager;
use crate::worktree::WorktreeManager;

use super::handle::{AgentHandle, AgentOutcome, AgentSpawnSpec, DRAIN_TIMEOUT};

/// Label applied on the hosting service when a work item is escalated
const NEEDS_HUMAN_LABEL: &str = "needs-human";

/// Ceiling for the one-shot availability probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(120);

/// Work the control loops ask the pool to do
#[derive(Debug)]
pub enum DispatchRequest {
    /// Spawn an implement agent for a pending work item
    Implement { issue_number: i64 },
    /// Spawn a fix agent for an open review iteration
    Fix {
        pr_number: i64,
        iteration: u32,
        iteration_id: i64,
        branch: String,
        threads: ThreadsView,
        ci_failed: bool,
    },
}

/// Shared context cloned into every supervision task
struct PoolCtx {
    config: Config,
    state: StateManager,
    worktrees: WorktreeManager,
    host: Arc<dyn HostClient>,
}

/// The supervisor. Single owner of live handles; everything else observes
/// agent state through the store.
pub struct AgentPool {
    ctx: Arc<PoolCtx>,
    prompts: PromptBuilder,
    tasks: HashMap<String, JoinHandle<()>>,
}

impl AgentPool {
    pub fn new(
        config: Config,
        state: StateManager,
        worktrees: WorktreeManager,
        host: Arc<dyn HostClient>,
        prompts: PromptBuilder,
    ) -> Self {
        Self {
            ctx: Arc::new(PoolCtx {
                config,
                state,
                worktrees,
                host,
            }),
            prompts,
            tasks: HashMap::new(),
        }
    }

    /// Run the supervisor until shutdown
    ///
    /// On shutdown the supervision tasks are dropped but the agent processes
    /// are not signalled; they are detached and startup recovery reconciles.
    pub async fn run(mut self, mut dispatch_rx: mpsc::Receiver<DispatchRequest>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("agent pool starting");
        let mut watcher = tokio::time::interval(Duration::from_secs(self.ctx.config.rate_limit_retry_interval));
        watcher.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = dispatch_rx.recv() => {
                    match request {
                        Some(request) => self.handle_dispatch(request).await,
                        None => {
                            debug!("dispatch channel closed");
                            break;
                        }
                    }
                }
                _ = watcher.tick() => {
                    self.check_rate_limited().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("agent pool: shutdown signal received");
                    break;
                }
            }
            self.tasks.retain(|_, task| !task.is_finished());
        }

        // Bounded drain: supervision tasks whose agent already exited get a
        // window to flush their readers' last events into the store. Tasks
        // still waiting on a live agent are aborted; the agent continues
        // detached and recovery re-attaches by pid on next start.
        info!(live_tasks = self.tasks.len(), "agent pool stopping; draining event readers");
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        for (agent_id, mut task) in self.tasks.drain() {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(_) => debug!(%agent_id, "supervision task drained"),
                Err(_) => {
                    task.abort();
                    debug!(%agent_id, "supervision task aborted; agent continues detached");
                }
            }
        }
    }

    async fn handle_dispatch(&mut self, request: DispatchRequest) {
        match request {
            DispatchRequest::Implement { issue_number } => {
                if let Err(e) = self.dispatch_implement(issue_number).await {
                    warn!(issue_number, error = %e, "implement dispatch failed");
                }
            }
            DispatchRequest::Fix {
                pr_number,
                iteration,
                iteration_id,
                branch,
                threads,
                ci_failed,
            } => {
                if let Err(e) = self
                    .dispatch_fix(pr_number, iteration, iteration_id, &branch, threads, ci_failed)
                    .await
                {
                    warn!(pr_number, iteration, error = %e, "fix dispatch failed");
                }
            }
        }
    }

    /// True when a slot is free under the concurrency ceiling
    async fn has_capacity(&self) -> bool {
        match self.ctx.state.count_running().await {
            Ok(running) => running < self.ctx.config.max_concurrent_agents,
            Err(e) => {
                warn!(error = %e, "capacity check failed, deferring dispatch");
                false
            }
        }
    }

    async fn dispatch_implement(&mut self, issue_number: i64) -> Result<()> {
        if !self.has_capacity().await {
            debug!(issue_number, "at concurrency ceiling, dispatch deferred to next poll");
            return Ok(());
        }
        if self
            .ctx
            .state
            .active_run_for_work_item(issue_number)
            .await
            .map_err(|e| eyre!("{e}"))?
            .is_some()
        {
            debug!(issue_number, "an agent is already active on this work item");
            return Ok(());
        }

        let item = self
            .ctx
            .state
            .get_work_item(issue_number)
            .await
            .map_err(|e| eyre!("{e}"))?
            .ok_or_else(|| eyre!("work item #{issue_number} not found"))?;
        if item.status != crate::domain::WorkItemStatus::Pending {
            debug!(issue_number, status = %item.status, "work item not pending, skipping");
            return Ok(());
        }

        let attempt = item.attempts + 1;
        let agent_id = implement_agent_id(issue_number, attempt);
        let branch = WorktreeManager::implement_branch(issue_number);

        let capabilities = if self.ctx.config.skills_enabled {
            skills::discover(&self.ctx.config.skills_dir)
        } else {
            Vec::new()
        };

        let prompt = self.prompts.implement(&ImplementContext {
            issue_number,
            title: item.title.clone(),
            body: item.body.clone(),
            branch: branch.clone(),
            base_branch: self.ctx.config.base_branch.clone(),
            max_turns: self.ctx.config.max_turns_implement,
            skills: capabilities,
            retry_hint: (item.attempts > 0)
                .then(|| "a previous attempt at this issue did not produce a merged pull request".to_string()),
        })?;

        self.ctx
            .worktrees
            .ensure_repo_updated()
            .await
            .map_err(|e| eyre!("repo update failed: {e}"))?;
        let worktree = self
            .ctx
            .worktrees
            .create_for_implement(issue_number)
            .await
            .map_err(|e| eyre!("worktree creation failed: {e}"))?;

        // The claim is the serialization point: a concurrent dispatch loses
        // here and backs out its worktree.
        let claimed = self
            .ctx
            .state
            .claim_work_item(issue_number, &agent_id)
            .await
            .map_err(|e| eyre!("{e}"))?;
        if !claimed {
            debug!(issue_number, "claim lost, backing out");
            let _ = self.ctx.worktrees.cleanup(&worktree).await;
            return Ok(());
        }

        let mut run = AgentRun::new_running(agent_id.clone(), AgentKind::Implement);
        run.work_item_number = Some(issue_number);
        run.worktree_path = Some(worktree.to_string_lossy().to_string());
        run.branch_name = Some(branch.clone());
        self.ctx.state.create_agent_run(run).await.map_err(|e| eyre!("{e}"))?;

        let mut spec = AgentSpawnSpec::new(agent_id.clone(), prompt, worktree.clone(), self.ctx.config.allowed_tools());
        spec.max_turns = Some(self.ctx.config.max_turns_implement);

        self.spawn_supervised(spec, SupervisedRole::Implement {
            issue_number,
            branch,
            title: item.title,
        })
        .await;
        Ok(())
    }

    async fn dispatch_fix(
        &mut self,
        pr_number: i64,
        iteration: u32,
        iteration_id: i64,
        branch: &str,
        threads: ThreadsView,
        ci_failed: bool,
    ) -> Result<()> {
        if !self.has_capacity().await {
            debug!(pr_number, "at concurrency ceiling, fix dispatch deferred");
            return Ok(());
        }
        if self
            .ctx
            .state
            .active_run_for_pr(pr_number)
            .await
            .map_err(|e| eyre!("{e}"))?
            .is_some()
        {
            debug!(pr_number, "an agent is already active on this PR");
            return Ok(());
        }

        let agent_id = fix_agent_id(pr_number, iteration);

        let capabilities = if self.ctx.config.skills_enabled {
            skills::discover(&self.ctx.config.skills_dir)
        } else {
            Vec::new()
        };

        let prompt = self.prompts.fix(&FixContext {
            pr_number,
            branch: branch.to_string(),
            max_turns: self.ctx.config.max_turns_fix,
            ci_failed,
            threads: threads.unresolved.clone(),
            skills: capabilities,
        })?;

        self.ctx
            .worktrees
            .ensure_repo_updated()
            .await
            .map_err(|e| eyre!("repo update failed: {e}"))?;
        let worktree = self
            .ctx
            .worktrees
            .create_for_fix(pr_number, branch)
            .await
            .map_err(|e| eyre!("worktree creation failed: {e}"))?;

        let mut run = AgentRun::new_running(agent_id.clone(), AgentKind::FixReview);
        run.pr_number = Some(pr_number);
        run.worktree_path = Some(worktree.to_string_lossy().to_string());
        run.branch_name = Some(branch.to_string());
        self.ctx.state.create_agent_run(run).await.map_err(|e| eyre!("{e}"))?;
        self.ctx
            .state
            .link_fix_agent(iteration_id, &agent_id)
            .await
            .map_err(|e| eyre!("{e}"))?;

        let mut spec = AgentSpawnSpec::new(agent_id, prompt, worktree, self.ctx.config.allowed_tools());
        spec.max_turns = Some(self.ctx.config.max_turns_fix);

        self.spawn_supervised(spec, SupervisedRole::Fix {
            pr_number,
            iteration_id: Some(iteration_id),
        })
        .await;
        Ok(())
    }

    /// Spawn the process and a task that supervises it to completion
    async fn spawn_supervised(&mut self, spec: AgentSpawnSpec, role: SupervisedRole) {
        let agent_id = spec.agent_id.clone();
        let worktree = spec.worktree.clone();
        let ctx = self.ctx.clone();

        let handle = match AgentHandle::spawn(&spec, &ctx.config, ctx.state.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%agent_id, error = %e, "agent spawn failed");
                let outcome = AgentOutcome::Failed {
                    error: format!("spawn failed: {e}"),
                    summary: Default::default(),
                };
                finish(ctx, agent_id, worktree, role, outcome).await;
                return;
            }
        };

        if let Err(e) = self.ctx.state.record_agent_pid(&agent_id, handle.pid).await {
            warn!(%agent_id, error = %e, "failed to record agent pid");
        }

        let timeout = Duration::from_secs(ctx.config.agent_timeout_secs);
        let task = tokio::spawn(async move {
            let outcome = handle.wait(timeout).await;
            finish(ctx, agent_id, worktree, role, outcome).await;
        });
        self.tasks.insert(spec.agent_id, task);
    }

    /// Rate-limit watcher tick: probe availability, resume paused runs
    async fn check_rate_limited(&mut self) {
        let limited = match self.ctx.state.list_rate_limited_runs().await {
            Ok(limited) => limited,
            Err(e) => {
                warn!(error = %e, "could not list rate-limited runs");
                return;
            }
        };
        if limited.is_empty() {
            return;
        }

        info!(count = limited.len(), "probing upstream availability for rate-limited agents");
        if !probe_available(&self.ctx.config).await {
            info!("availability probe failed; agents stay paused");
            return;
        }

        for run in limited {
            if run.resume_count >= self.ctx.config.max_rate_limit_resumes {
                warn!(agent_id = %run.agent_id, resume_count = run.resume_count, "resume ceiling reached, leaving paused");
                continue;
            }
            if !self.has_capacity().await {
                debug!("no capacity for further resumes this tick");
                break;
            }
            if let Err(e) = self.resume_run(&run).await {
                warn!(agent_id = %run.agent_id, error = %e, "resume failed");
            }
        }
    }

    /// Spawn a successor run in the preserved worktree
    async fn resume_run(&mut self, prior: &AgentRun) -> Result<()> {
        let worktree = PathBuf::from(
            prior
                .worktree_path
                .as_deref()
                .ok_or_else(|| eyre!("rate-limited run has no worktree"))?,
        );
        let branch = prior.branch_name.clone().unwrap_or_default();

        // Flip the prior row first; a lost guard means someone else resumed it
        let flipped = self
            .ctx
            .state
            .record_agent_status(&prior.agent_id, AgentRunStatus::Resumed, None)
            .await
            .map_err(|e| eyre!("{e}"))?;
        if !flipped {
            return Ok(());
        }

        let (resume_ctx, max_turns, role) = match prior.kind {
            AgentKind::Implement => {
                let issue_number = prior
                    .work_item_number
                    .ok_or_else(|| eyre!("implement run without work item"))?;
                // The suspended dispatch becomes live again
                self.ctx
                    .state
                    .recount_attempt(issue_number)
                    .await
                    .map_err(|e| eyre!("{e}"))?;
                let title = self
                    .ctx
                    .state
                    .get_work_item(issue_number)
                    .await
                    .map_err(|e| eyre!("{e}"))?
                    .map(|item| item.title)
                    .unwrap_or_default();
                (
                    ResumeContext::for_implement(issue_number, branch.clone()),
                    self.ctx.config.max_turns_implement,
                    SupervisedRole::Implement {
                        issue_number,
                        branch: branch.clone(),
                        title,
                    },
                )
            }
            AgentKind::FixReview => {
                let pr_number = prior.pr_number.ok_or_else(|| eyre!("fix run without PR"))?;
                let iteration_id = match self.ctx.state.latest_iteration(pr_number).await {
                    Ok(Some(iteration)) if iteration.status == IterationStatus::Fixing => Some(iteration.id),
                    _ => None,
                };
                (
                    ResumeContext::for_fix(pr_number, branch.clone()),
                    self.ctx.config.max_turns_fix,
                    SupervisedRole::Fix {
                        pr_number,
                        iteration_id,
                    },
                )
            }
        };

        let new_id = format!("{}-resume-{}", resume_base(&prior.agent_id), prior.resume_count + 1);
        let prompt = self.prompts.resume(&resume_ctx)?;

        let mut run = AgentRun::new_running(new_id.clone(), prior.kind);
        run.work_item_number = prior.work_item_number;
        run.pr_number = prior.pr_number;
        run.worktree_path = prior.worktree_path.clone();
        run.branch_name = prior.branch_name.clone();
        run.resume_count = prior.resume_count + 1;
        self.ctx.state.create_agent_run(run).await.map_err(|e| eyre!("{e}"))?;

        // Re-link the open iteration to the successor
        if let SupervisedRole::Fix {
            iteration_id: Some(iteration_id),
            ..
        } = &role
        {
            let _ = self.ctx.state.link_fix_agent(*iteration_id, &new_id).await;
        }

        let mut spec = AgentSpawnSpec::new(new_id.clone(), prompt, worktree, self.ctx.config.allowed_tools());
        spec.session_id = prior.session_id.clone();
        spec.continue_session = prior.session_id.is_none();
        spec.max_turns = Some(max_turns);

        info!(
            prior = %prior.agent_id,
            successor = %new_id,
            resume_count = prior.resume_count + 1,
            attached_session = prior.session_id.is_some(),
            "resuming rate-limited run"
        );
        self.spawn_supervised(spec, role).await;
        Ok(())
    }
}

/// What the supervision task needs to do run bookkeeping after the outcome
#[derive(Debug, Clone)]
enum SupervisedRole {
    Implement {
        issue_number: i64,
        branch: String,
        title: String,
    },
    Fix {
        pr_number: i64,
        iteration_id: Option<i64>,
    },
}

/// Strip any `-resume-N` suffix so successor ids stay flat
fn resume_base(agent_id: &str) -> &str {
    match agent_id.find("-resume-") {
        Some(idx) => &agent_id[..idx],
        None => agent_id,
    }
}

/// Completion bookkeeping, shared by fresh and resumed runs
async fn finish(ctx: Arc<PoolCtx>, agent_id: String, worktree: PathBuf, role: SupervisedRole, outcome: AgentOutcome) {
    match role {
        SupervisedRole::Implement {
            issue_number,
            branch,
            title,
        } => finish_implement(ctx, agent_id, issue_number, branch, title, worktree, outcome).await,
        SupervisedRole::Fix {
            pr_number,
            iteration_id,
        } => finish_fix(ctx, agent_id, pr_number, iteration_id, worktree, outcome).await,
    }
}

async fn finish_implement(
    ctx: Arc<PoolCtx>,
    agent_id: String,
    issue_number: i64,
    branch: String,
    title: String,
    worktree: PathBuf,
    outcome: AgentOutcome,
) {
    match outcome {
        AgentOutcome::Completed { summary } => {
            let pr_number = match summary.pr_number {
                Some(pr) => Some(pr),
                None => recover_pr(&ctx, issue_number, &branch, &title, &worktree).await,
            };
            match pr_number {
                Some(pr) => {
                    info!(%agent_id, issue_number, pr, "implement run completed with PR");
                    record_status(&ctx, &agent_id, AgentRunStatus::Completed, None).await;
                    if let Err(e) = ctx.state.record_pr_created(issue_number, pr).await {
                        warn!(issue_number, error = %e, "failed to record pr_created");
                    }
                    cleanup_worktree(&ctx, &worktree).await;
                }
                None => {
                    implement_failure(&ctx, &agent_id, issue_number, AgentRunStatus::Failed, "no PR produced", &worktree)
                        .await;
                }
            }
        }
        AgentOutcome::Failed { error, .. } => {
            implement_failure(&ctx, &agent_id, issue_number, AgentRunStatus::Failed, &error, &worktree).await;
        }
        AgentOutcome::Timeout { .. } => {
            implement_failure(
                &ctx,
                &agent_id,
                issue_number,
                AgentRunStatus::Timeout,
                "exceeded wall-clock ceiling",
                &worktree,
            )
            .await;
        }
        AgentOutcome::RateLimited { .. } => {
            info!(%agent_id, issue_number, "implement run rate-limited; worktree preserved");
            if let Err(e) = ctx.state.record_rate_limited(&agent_id).await {
                warn!(%agent_id, error = %e, "failed to record rate_limited");
            }
            // The suspended dispatch must not show as an attempt
            if let Err(e) = ctx.state.uncount_attempt(issue_number).await {
                warn!(issue_number, error = %e, "failed to uncount attempt");
            }
        }
    }
}

/// Record the failure, clean up, and re-queue or escalate
async fn implement_failure(
    ctx: &Arc<PoolCtx>,
    agent_id: &str,
    issue_number: i64,
    status: AgentRunStatus,
    error: &str,
    worktree: &PathBuf,
) {
    warn!(agent_id, issue_number, %status, error, "implement run failed");
    record_status(ctx, agent_id, status, Some(error)).await;
    cleanup_worktree(ctx, worktree).await;

    let attempts = match ctx.state.get_work_item(issue_number).await {
        Ok(Some(item)) => item.attempts,
        _ => return,
    };
    if attempts >= ctx.config.max_issue_retries {
        info!(issue_number, attempts, "retry ceiling reached, escalating to human");
        if let Err(e) = ctx.state.record_needs_human(issue_number).await {
            warn!(issue_number, error = %e, "failed to record needs_human");
        }
        if let Err(e) = ctx.host.add_label(issue_number, NEEDS_HUMAN_LABEL).await {
            warn!(issue_number, error = %e, "failed to apply needs-human label");
        }
    } else if let Err(e) = ctx.state.reset_to_pending(issue_number).await {
        warn!(issue_number, error = %e, "failed to re-queue work item");
    }
}

async fn finish_fix(
    ctx: Arc<PoolCtx>,
    agent_id: String,
    pr_number: i64,
    iteration_id: Option<i64>,
    worktree: PathBuf,
    outcome: AgentOutcome,
) {
    match outcome {
        AgentOutcome::Completed { .. } => {
            info!(%agent_id, pr_number, "fix run completed");
            record_status(&ctx, &agent_id, AgentRunStatus::Completed, None).await;
            if let Some(id) = iteration_id
                && let Err(e) = ctx.state.record_iteration_status(id, IterationStatus::Fixed).await
            {
                warn!(pr_number, error = %e, "failed to mark iteration fixed");
            }
            cleanup_worktree(&ctx, &worktree).await;
        }
        AgentOutcome::Failed { error, .. } => {
            fix_failure(&ctx, &agent_id, pr_number, iteration_id, AgentRunStatus::Failed, &error, &worktree).await;
        }
        AgentOutcome::Timeout { .. } => {
            fix_failure(
                &ctx,
                &agent_id,
                pr_number,
                iteration_id,
                AgentRunStatus::Timeout,
                "exceeded wall-clock ceiling",
                &worktree,
            )
            .await;
        }
        AgentOutcome::RateLimited { .. } => {
            info!(%agent_id, pr_number, "fix run rate-limited; worktree preserved");
            if let Err(e) = ctx.state.record_rate_limited(&agent_id).await {
                warn!(%agent_id, error = %e, "failed to record rate_limited");
            }
        }
    }
}

async fn fix_failure(
    ctx: &Arc<PoolCtx>,
    agent_id: &str,
    pr_number: i64,
    iteration_id: Option<i64>,
    status: AgentRunStatus,
    error: &str,
    worktree: &PathBuf,
) {
    warn!(agent_id, pr_number, %status, error, "fix run failed");
    record_status(ctx, agent_id, status, Some(error)).await;
    if let Some(id) = iteration_id
        && let Err(e) = ctx.state.record_iteration_status(id, IterationStatus::Failed).await
    {
        warn!(pr_number, error = %e, "failed to mark iteration failed");
    }
    cleanup_worktree(ctx, worktree).await;
}

async fn record_status(ctx: &Arc<PoolCtx>, agent_id: &str, status: AgentRunStatus, error: Option<&str>) {
    if let Err(e) = ctx.state.record_agent_status(agent_id, status, error).await {
        warn!(%agent_id, error = %e, "failed to record agent status");
    }
}

async fn cleanup_worktree(ctx: &Arc<PoolCtx>, worktree: &PathBuf) {
    if let Err(e) = ctx.worktrees.cleanup(worktree).await {
        warn!(worktree = %worktree.display(), error = %e, "worktree cleanup failed");
    }
}

/// PR recovery for implement runs whose event stream advertised no PR
///
/// Checks, in order: an open PR already exists for the branch; the branch was
/// pushed but no PR opened; local commits exist but were never pushed.
async fn recover_pr(
    ctx: &Arc<PoolCtx>,
    issue_number: i64,
    branch: &str,
    title: &str,
    worktree: &PathBuf,
) -> Option<i64> {
    debug!(issue_number, branch, "running PR recovery");

    match ctx.host.find_open_pr_by_branch(branch).await {
        Ok(Some(pr)) => {
            info!(issue_number, pr, "PR recovery: open PR found for branch");
            return Some(pr);
        }
        Ok(None) => {}
        Err(e) => {
            warn!(issue_number, error = %e, "PR recovery: branch lookup failed");
            return None;
        }
    }

    let pr_title = format!("Fix #{issue_number}: {title}");
    let pr_body = format!("Closes #{issue_number}.\n\nAutomated change for issue #{issue_number}.");

    match ctx.worktrees.has_remote_branch(branch).await {
        Ok(true) => {
            info!(issue_number, branch, "PR recovery: branch pushed, creating PR");
            return match ctx.host.create_pr(branch, &ctx.config.base_branch, &pr_title, &pr_body).await {
                Ok(pr) => Some(pr),
                Err(e) => {
                    warn!(issue_number, error = %e, "PR recovery: create failed");
                    None
                }
            };
        }
        Ok(false) => {}
        Err(e) => {
            warn!(issue_number, error = %e, "PR recovery: remote branch check failed");
            return None;
        }
    }

    if !worktree.exists() {
        return None;
    }
    match ctx.worktrees.has_unpushed_commits(worktree, branch).await {
        Ok(true) => {
            info!(issue_number, branch, "PR recovery: unpushed commits found, pushing");
            if let Err(e) = ctx.worktrees.push_branch(worktree, branch).await {
                warn!(issue_number, error = %e, "PR recovery: push failed");
                return None;
            }
            match ctx.host.create_pr(branch, &ctx.config.base_branch, &pr_title, &pr_body).await {
                Ok(pr) => Some(pr),
                Err(e) => {
                    warn!(issue_number, error = %e, "PR recovery: create failed after push");
                    None
                }
            }
        }
        Ok(false) => None,
        Err(e) => {
            warn!(issue_number, error = %e, "PR recovery: commit check failed");
            None
        }
    }
}

/// One-shot availability probe: a trivial single-turn invocation
async fn probe_available(config: &Config) -> bool {
    let mut cmd = tokio::process::Command::new(&config.agent_command);
    cmd.arg("-p")
        .arg(crate::prompts::PROBE_PROMPT)
        .arg("--max-turns")
        .arg("1")
        .current_dir(&config.target_repo_path)
        .env("CLAUDE_CODE_OAUTH_TOKEN", &config.claude_token)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    match tokio::time::timeout(PROBE_TIMEOUT, cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            warn!(error = %e, "availability probe could not run");
            false
        }
        Err(_) => {
            warn!("availability probe timed out");
            false
        }
    }
}
