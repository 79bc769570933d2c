//! Issue poller
//!
//! Periodically discovers activatable issues on the hosting service, seeds
//! work items, and asks the supervisor to dispatch implement agents. Failed
//! ticks back off exponentially, capped at ten minutes.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, eyre};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::DispatchRequest;
use crate::config::Config;
use crate::domain::WorkItemStatus;
use crate::github::{HostClient, Issue};
use crate::store::StateManager;
use crate::worktree::WorktreeManager;

/// Backoff cap for failing ticks
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Discovers work items and requests implement dispatches
pub struct IssuePoller {
    config: Config,
    state: StateManager,
    host: Arc<dyn HostClient>,
    dispatch_tx: mpsc::Sender<DispatchRequest>,
}

impl IssuePoller {
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
        info!(interval_secs = self.config.poll_interval_secs, "issue poller starting");
        let base = Duration::from_secs(self.config.poll_interval_secs);
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
                            warn!(error = %e, consecutive_errors, backoff_secs = delay.as_secs(), "issue poll failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("issue poller: shutdown signal received");
                    break;
                }
            }
        }
    }

    /// One poll pass over the labelled open issues
    pub async fn tick(&self) -> Result<()> {
        let issues = self
            .host
            .list_open_issues(&self.config.issue_label)
            .await
            .map_err(|e| eyre!("issue list failed: {e}"))?;
        debug!(count = issues.len(), label = %self.config.issue_label, "discovered labelled issues");

        for issue in &issues {
            self.process_issue(issue).await?;
        }
        Ok(())
    }

    async fn process_issue(&self, issue: &Issue) -> Result<()> {
        // Items already past pending need no hosting-service traffic
        if let Some(existing) = self
            .state
            .get_work_item(issue.number)
            .await
            .map_err(|e| eyre!("{e}"))?
            && existing.status != WorkItemStatus::Pending
        {
            debug!(issue = issue.number, status = %existing.status, "already tracked, skipping");
            return Ok(());
        }

        // Trigger gate: a configured mention must appear in some comment
        if !self.config.trigger_mention.is_empty() {
            let comments = self
                .host
                .issue_comments(issue.number)
                .await
                .map_err(|e| eyre!("comment fetch failed for #{}: {e}", issue.number))?;
            if !has_trigger(&comments, &self.config.trigger_mention) {
                debug!(issue = issue.number, "trigger mention absent, skipping");
                return Ok(());
            }
        }

        // Existing-PR detection: seed pr_created directly, never dispatch
        let branch = WorktreeManager::implement_branch(issue.number);
        if let Some(pr) = self
            .host
            .find_open_pr_by_branch(&branch)
            .await
            .map_err(|e| eyre!("PR lookup failed for #{}: {e}", issue.number))?
        {
            info!(issue = issue.number, pr, "open PR already exists, seeding as pr_created");
            self.state
                .seed_pr_created(issue.number, &issue.title, &issue.body, pr)
                .await
                .map_err(|e| eyre!("{e}"))?;
            return Ok(());
        }

        let item = self
            .state
            .upsert_work_item(issue.number, &issue.title, &issue.body)
            .await
            .map_err(|e| eyre!("{e}"))?;
        if item.status != WorkItemStatus::Pending {
            return Ok(());
        }
        if item.attempts >= self.config.max_issue_retries {
            debug!(issue = issue.number, attempts = item.attempts, "retry ceiling reached, not dispatching");
            return Ok(());
        }

        // Capacity check: over-capacity requests wait for a later tick
        let running = self.state.count_running().await.map_err(|e| eyre!("{e}"))?;
        if running >= self.config.max_concurrent_agents {
            debug!(issue = issue.number, running, "no free agent slot, deferring");
            return Ok(());
        }

        info!(issue = issue.number, "requesting implement dispatch");
        self.dispatch_tx
            .send(DispatchRequest::Implement {
                issue_number: issue.number,
            })
            .await
            .map_err(|_| eyre!("dispatch channel closed"))?;
        Ok(())
    }
}

/// True when any comment contains the trigger mention
fn has_trigger(comments: &[String], mention: &str) -> bool {
    comments.iter().any(|comment| comment.contains(mention))
}

/// min(base * 2^k, 10 min) for k consecutive errors
fn backoff_delay(base: Duration, consecutive_errors: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_errors.min(10));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::testing::ScriptedHost;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        state: StateManager,
        host: Arc<ScriptedHost>,
        poller: IssuePoller,
        dispatch_rx: mpsc::Receiver<DispatchRequest>,
    }

    fn fixture(trigger_mention: &str) -> Fixture {
        let temp = TempDir::new().unwrap();
        let config = Config {
            claude_token: "tok".to_string(),
            gh_token: "tok".to_string(),
            github_repo: "octo/widgets".to_string(),
            target_repo_path: temp.path().to_path_buf(),
            base_branch: "main".to_string(),
            max_concurrent_agents: 3,
            max_turns_implement: 30,
            max_turns_fix: 20,
            agent_timeout_secs: 1800,
            poll_interval_secs: 300,
            pr_poll_interval_secs: 120,
            issue_label: "agent".to_string(),
            trigger_mention: trigger_mention.to_string(),
            max_issue_retries: 3,
            max_pr_fix_retries: 5,
            rate_limit_retry_interval: 300,
            max_rate_limit_resumes: 5,
            skills_enabled: false,
            skills_dir: temp.path().join("skills"),
            worktree_dir: temp.path().join("worktrees"),
            db_path: temp.path().join("swarm.db"),
            dashboard_port: 0,
            agent_command: "claude".to_string(),
        };
        let state = StateManager::spawn(&config.db_path).unwrap();
        let host = Arc::new(ScriptedHost::default());
        let (dispatch_tx, dispatch_rx) = mpsc::channel(16);
        let poller = IssuePoller::new(config, state.clone(), host.clone(), dispatch_tx);
        Fixture {
            _temp: temp,
            state,
            host,
            poller,
            dispatch_rx,
        }
    }

    fn issue(number: i64) -> Issue {
        Issue {
            number,
            title: format!("Issue {number}"),
            body: "body".to_string(),
        }
    }

    #[tokio::test]
    async fn test_labelled_issue_with_mention_dispatches() {
        let mut fx = fixture("@claude-swarm");
        fx.host.issues.lock().unwrap().push(issue(42));
        fx.host
            .comments
            .lock()
            .unwrap()
            .insert(42, vec!["please @claude-swarm start".to_string()]);

        fx.poller.tick().await.unwrap();

        let request = fx.dispatch_rx.try_recv().unwrap();
        assert!(matches!(request, DispatchRequest::Implement { issue_number: 42 }));

        let item = fx.state.get_work_item(42).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_trigger_gate_blocks_without_mention() {
        let mut fx = fixture("@claude-swarm");
        fx.host.issues.lock().unwrap().push(issue(42));
        fx.host
            .comments
            .lock()
            .unwrap()
            .insert(42, vec!["unrelated chatter".to_string()]);

        fx.poller.tick().await.unwrap();

        assert!(fx.dispatch_rx.try_recv().is_err());
        assert!(fx.state.get_work_item(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_mention_disables_gate() {
        let mut fx = fixture("");
        fx.host.issues.lock().unwrap().push(issue(42));
        // No comments at all

        fx.poller.tick().await.unwrap();

        assert!(fx.dispatch_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_existing_pr_seeds_without_dispatch() {
        let mut fx = fixture("");
        fx.host.issues.lock().unwrap().push(issue(7));
        fx.host
            .pr_for_branch
            .lock()
            .unwrap()
            .insert("fix/issue-7".to_string(), 70);

        fx.poller.tick().await.unwrap();

        assert!(fx.dispatch_rx.try_recv().is_err());
        let item = fx.state.get_work_item(7).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::PrCreated);
        assert_eq!(item.pr_number, Some(70));
    }

    #[tokio::test]
    async fn test_tracked_non_pending_item_is_skipped() {
        let mut fx = fixture("");
        fx.host.issues.lock().unwrap().push(issue(9));
        fx.state.upsert_work_item(9, "t", "b").await.unwrap();
        fx.state.claim_work_item(9, "a1").await.unwrap();

        fx.poller.tick().await.unwrap();

        assert!(fx.dispatch_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_dispatch_at_attempt_ceiling() {
        let mut fx = fixture("");
        fx.host.issues.lock().unwrap().push(issue(88));

        // Three failed dispatches already concluded
        fx.state.upsert_work_item(88, "t", "b").await.unwrap();
        for i in 1..=3 {
            fx.state.claim_work_item(88, &format!("a{i}")).await.unwrap();
            fx.state.reset_to_pending(88).await.unwrap();
        }

        fx.poller.tick().await.unwrap();
        assert!(fx.dispatch_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_dispatch_over_capacity() {
        let mut fx = fixture("");
        fx.host.issues.lock().unwrap().push(issue(1));

        for i in 0..3 {
            let run = crate::domain::AgentRun::new_running(format!("busy-{i}"), crate::domain::AgentKind::Implement);
            fx.state.create_agent_run(run).await.unwrap();
        }

        fx.poller.tick().await.unwrap();
        assert!(fx.dispatch_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_tick_returns_error() {
        let fx = fixture("");
        *fx.host.fail.lock().unwrap() = true;
        assert!(fx.poller.tick().await.is_err());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(240));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(480));
        assert_eq!(backoff_delay(base, 4), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, 30), MAX_BACKOFF);
    }

    #[test]
    fn test_has_trigger() {
        let comments = vec!["hello".to_string(), "ok @claude-swarm go".to_string()];
        assert!(has_trigger(&comments, "@claude-swarm"));
        assert!(!has_trigger(&comments, "@other-bot"));
        assert!(!has_trigger(&[], "@claude-swarm"));
    }
}
