//! PR monitor
//!
//! Walks work items whose pull request is open, reads unresolved review
//! threads and CI status, and asks the supervisor for fix dispatches until
//! the PR is clean and merged or the iteration ceiling escalates it.
//! Resolution is gated strictly on the hosting service reporting a merge.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, eyre};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::DispatchRequest;
use crate::config::Config;
use crate::domain::{IterationStatus, WorkItem, WorkItemStatus};
use crate::github::{CheckStatus, HostClient, ThreadsView};
use crate::store::StateManager;

/// Backoff cap for failing ticks
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// What a poll pass decided for one PR
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    /// Merged on the hosting service; resolve the work item
    Resolve,
    /// Checks still running and nothing to fix yet
    Wait,
    /// Clean and green; keep polling until someone merges
    AwaitMerge,
    /// Review feedback or red CI; dispatch a fix agent
    Fix,
}

/// Drives the review-fix loop for every open PR
pub struct PrMonitor {
    config: Config,
    state: StateManager,
    host: Arc<dyn HostClient>,
    dispatch_tx: mpsc::Sender<DispatchRequest>,
}

impl PrMonitor {
    pub fn new(
        config: Config,
        state: StateManager,
        host: Arc<dyn HostClient>,
        dispatch_tx: mpsc::Sender<DispatchRequest>,
    ) -> Self {
        Self {
            config,
            state,
            host,
            dispatch_tx,
        }
    }

    /// Run until shutdown; the first tick fires immediately
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(interval_secs = self.config.pr_poll_interval_secs, "PR monitor starting");
        let base = Duration::from_secs(self.config.pr_poll_interval_secs);
        let mut consecutive_errors = 0u32;
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    match self.tick().await {
                        Ok(()) => {
                            consecutive_errors = 0;
                            delay = base;
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            delay = backoff_delay(base, consecutive_errors);
                            warn!(error = %e, consecutive_errors, backoff_secs = delay.as_secs(), "PR poll failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("PR monitor: shutdown signal received");
                    break;
                }
            }
        }
    }

    /// One pass over every work item in pr_created
    pub async fn tick(&self) -> Result<()> {
        let items = self
            .state
            .list_work_items(Some(WorkItemStatus::PrCreated))
            .await
            .map_err(|e| eyre!("{e}"))?;
        debug!(count = items.len(), "polling open PRs");

        let mut failures = 0u32;
        for item in &items {
            if let Err(e) = self.process_pr(item).await {
                warn!(issue = item.number, pr = ?item.pr_number, error = %e, "PR poll failed for item");
                failures += 1;
            }
        }
        if failures > 0 {
            return Err(eyre!("{failures} of {} PRs failed to poll", items.len()));
        }
        Ok(())
    }

    async fn process_pr(&self, item: &WorkItem) -> Result<()> {
        let pr_number = item.pr_number.ok_or_else(|| eyre!("pr_created item without PR number"))?;

        // Only one fix agent may be outstanding per PR
        if self
            .state
            .active_run_for_pr(pr_number)
            .await
            .map_err(|e| eyre!("{e}"))?
            .is_some()
        {
            debug!(pr = pr_number, "fix agent still active, waiting");
            return Ok(());
        }

        // A fixing iteration with no active run means the supervisor died
        // mid-flight; reconcile so the loop can move again
        let latest = self.state.latest_iteration(pr_number).await.map_err(|e| eyre!("{e}"))?;
        if let Some(latest) = &latest
            && latest.status == IterationStatus::Fixing
        {
            warn!(pr = pr_number, iteration = latest.iteration, "fixing iteration has no active run, marking failed");
            self.state
                .record_iteration_status(latest.id, IterationStatus::Failed)
                .await
                .map_err(|e| eyre!("{e}"))?;
        }

        let info = self.host.pr_info(pr_number).await.map_err(|e| eyre!("{e}"))?;
        let threads = if info.merged {
            ThreadsView::default()
        } else {
            self.host.unresolved_threads(pr_number).await.map_err(|e| eyre!("{e}"))?
        };
        let checks = if info.merged {
            CheckStatus::Passed
        } else {
            self.host.check_status(pr_number).await.map_err(|e| eyre!("{e}"))?
        };

        match decide(info.merged, &threads, checks) {
            Decision::Resolve => {
                info!(issue = item.number, pr = pr_number, "PR merged, resolving work item");
                self.state.record_resolved(item.number).await.map_err(|e| eyre!("{e}"))?;
            }
            Decision::Wait => {
                debug!(pr = pr_number, "checks pending, waiting");
            }
            Decision::AwaitMerge => {
                info!(pr = pr_number, "clean and green, awaiting external merge");
            }
            Decision::Fix => {
                self.open_iteration_and_dispatch(item, pr_number, &info.head_ref, threads, checks)
                    .await?;
            }
        }
        Ok(())
    }

    /// Open the next iteration (or reuse a pending one) and request a fix
    async fn open_iteration_and_dispatch(
        &self,
        item: &WorkItem,
        pr_number: i64,
        branch: &str,
        threads: ThreadsView,
        checks: CheckStatus,
    ) -> Result<()> {
        let latest = self.state.latest_iteration(pr_number).await.map_err(|e| eyre!("{e}"))?;

        let (iteration, iteration_id) = match latest {
            // A pending iteration whose dispatch was deferred gets re-sent
            Some(latest) if latest.status == IterationStatus::Pending => (latest.iteration, latest.id),
            _ => {
                let count = self.state.count_iterations(pr_number).await.map_err(|e| eyre!("{e}"))?;
                if count >= self.config.max_pr_fix_retries {
                    info!(
                        issue = item.number,
                        pr = pr_number,
                        iterations = count,
                        "fix-iteration ceiling reached, escalating to human"
                    );
                    self.state.record_needs_human(item.number).await.map_err(|e| eyre!("{e}"))?;
                    if let Err(e) = self.host.add_label(item.number, "needs-human").await {
                        warn!(issue = item.number, error = %e, "failed to apply needs-human label");
                    }
                    return Ok(());
                }
                let iteration = count + 1;
                let id = self
                    .state
                    .upsert_review_iteration(pr_number, iteration, threads.comment_count, threads.snapshot_json())
                    .await
                    .map_err(|e| eyre!("{e}"))?;
                info!(
                    pr = pr_number,
                    iteration,
                    comments = threads.comment_count,
                    ci_failed = (checks == CheckStatus::Failed),
                    "opened review iteration"
                );
                (iteration, id)
            }
        };

        self.dispatch_tx
            .send(DispatchRequest::Fix {
                pr_number,
                iteration,
                iteration_id,
                branch: branch.to_string(),
                threads,
                ci_failed: checks == CheckStatus::Failed,
            })
            .await
            .map_err(|_| eyre!("dispatch channel closed"))?;
        Ok(())
    }
}

/// Merge wins, then review feedback and red CI, then the CI bucket
fn decide(merged: bool, threads: &ThreadsView, checks: CheckStatus) -> Decision {
    if merged {
        return Decision::Resolve;
    }
    if threads.has_feedback() || checks == CheckStatus::Failed {
        return Decision::Fix;
    }
    match checks {
        CheckStatus::Pending => Decision::Wait,
        _ => Decision::AwaitMerge,
    }
}

/// min(base * 2^k, 10 min) for k consecutive errors
fn backoff_delay(base: Duration, consecutive_errors: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_errors.min(10));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}
