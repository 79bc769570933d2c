//! Crash recovery
//!
//! Reconciles the store against the host on startup. Agents are detached
//! processes, so a run recorded as active may still be alive after an
//! orchestrator restart; only runs whose pid is gone are failed as orphaned.

use tracing::{debug, info, warn};

use crate::domain::{AgentKind, AgentRunStatus};
use crate::worktree::WorktreeManager;

use super::StateManager;

/// Recovery statistics
#[derive(Debug, Default)]
pub struct RecoveryStats {
    /// Runs whose process is still alive and were left alone
    pub still_alive: usize,
    /// Runs failed as orphaned
    pub orphaned: usize,
    /// Work items reset to pending
    pub requeued: usize,
    /// Worktrees removed (orphaned runs plus unowned directories)
    pub worktrees_removed: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "alive: {}, orphaned: {}, requeued: {}, worktrees removed: {}",
            self.still_alive, self.orphaned, self.requeued, self.worktrees_removed
        )
    }
}

/// Reconcile active runs against live pids, then sweep unowned worktrees
///
/// Idempotent: a second pass over the same store converges to the same state.
pub async fn recover(state: &StateManager, worktrees: &WorktreeManager) -> eyre::Result<RecoveryStats> {
    debug!("recover: called");
    let mut stats = RecoveryStats::default();
    let mut preserved_paths: Vec<String> = Vec::new();

    let active = state
        .list_active_runs()
        .await
        .map_err(|e| eyre::eyre!("failed to list active runs: {e}"))?;

    for run in &active {
        let alive = run.pid.is_some_and(is_process_alive);
        if alive {
            debug!(agent_id = %run.agent_id, pid = ?run.pid, "recover: agent still alive, leaving alone");
            stats.still_alive += 1;
            if let Some(path) = &run.worktree_path {
                preserved_paths.push(path.clone());
            }
            continue;
        }

        info!(agent_id = %run.agent_id, status = %run.status, "recover: marking orphaned run failed");
        state
            .record_agent_status(&run.agent_id, AgentRunStatus::Failed, Some("orphaned"))
            .await
            .map_err(|e| eyre::eyre!("failed to mark {} orphaned: {e}", run.agent_id))?;
        stats.orphaned += 1;

        if run.kind == AgentKind::Implement
            && let Some(number) = run.work_item_number
        {
            // Guarded: only in_progress items without a PR go back to pending
            state
                .reset_to_pending(number)
                .await
                .map_err(|e| eyre::eyre!("failed to reset work item #{number}: {e}"))?;
            stats.requeued += 1;
        }

        if let Some(path) = &run.worktree_path {
            let path = std::path::PathBuf::from(path);
            if let Err(e) = worktrees.cleanup(&path).await {
                warn!(path = %path.display(), error = %e, "recover: worktree cleanup failed");
            } else {
                stats.worktrees_removed += 1;
            }
        }
    }

    // Sweep directories no surviving run owns
    match worktrees.list_paths().await {
        Ok(paths) => {
            for path in paths {
                let owned = preserved_paths.iter().any(|p| std::path::Path::new(p) == path);
                if !owned {
                    info!(path = %path.display(), "recover: removing unowned worktree");
                    if let Err(e) = worktrees.cleanup(&path).await {
                        warn!(path = %path.display(), error = %e, "recover: sweep cleanup failed");
                    } else {
                        stats.worktrees_removed += 1;
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "recover: could not list worktrees for sweep"),
    }

    if stats.orphaned > 0 || stats.worktrees_removed > 0 {
        info!("recovery complete: {}", stats);
    } else {
        debug!("recover: nothing to reconcile");
    }
    Ok(stats)
}

/// Check whether a process with the given pid is running
///
/// Signal 0 probes existence without affecting the process.
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AgentRun;
    use crate::worktree::WorktreeConfig;
    use tempfile::TempDir;

    /// Far above any real pid_max, and still positive as an i32
    const DEAD_PID: u32 = i32::MAX as u32;

    fn worktree_manager(temp: &TempDir) -> WorktreeManager {
        WorktreeManager::new(WorktreeConfig {
            repo_root: temp.path().join("repo"),
            base_dir: temp.path().join("worktrees"),
            base_branch: "main".to_string(),
        })
    }

    #[tokio::test]
    async fn test_orphaned_run_is_failed_and_requeued() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("swarm.db")).unwrap();
        let worktrees = worktree_manager(&temp);

        state.upsert_work_item(42, "t", "b").await.unwrap();
        state.claim_work_item(42, "a1").await.unwrap();

        let mut run = AgentRun::new_running("a1".to_string(), AgentKind::Implement);
        run.work_item_number = Some(42);
        run.pid = Some(DEAD_PID); // far above pid_max
        state.create_agent_run(run).await.unwrap();

        let stats = recover(&state, &worktrees).await.unwrap();
        assert_eq!(stats.orphaned, 1);
        assert_eq!(stats.requeued, 1);

        let run = state.get_agent_run("a1").await.unwrap().unwrap();
        assert_eq!(run.status, AgentRunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("orphaned"));

        let item = state.get_work_item(42).await.unwrap().unwrap();
        assert_eq!(item.status, crate::domain::WorkItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_live_run_is_left_alone() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("swarm.db")).unwrap();
        let worktrees = worktree_manager(&temp);

        let mut run = AgentRun::new_running("a1".to_string(), AgentKind::Implement);
        run.pid = Some(std::process::id()); // our own pid is alive
        state.create_agent_run(run).await.unwrap();

        let stats = recover(&state, &worktrees).await.unwrap();
        assert_eq!(stats.still_alive, 1);
        assert_eq!(stats.orphaned, 0);

        let run = state.get_agent_run("a1").await.unwrap().unwrap();
        assert_eq!(run.status, AgentRunStatus::Running);
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("swarm.db")).unwrap();
        let worktrees = worktree_manager(&temp);

        state.upsert_work_item(1, "t", "b").await.unwrap();
        state.claim_work_item(1, "a1").await.unwrap();
        let mut run = AgentRun::new_running("a1".to_string(), AgentKind::Implement);
        run.work_item_number = Some(1);
        run.pid = Some(DEAD_PID);
        state.create_agent_run(run).await.unwrap();

        let first = recover(&state, &worktrees).await.unwrap();
        assert_eq!(first.orphaned, 1);

        // Second run converges: nothing left to reconcile
        let second = recover(&state, &worktrees).await.unwrap();
        assert_eq!(second.orphaned, 0);
        assert_eq!(second.requeued, 0);
    }

    #[tokio::test]
    async fn test_no_requeue_when_pr_exists() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("swarm.db")).unwrap();
        let worktrees = worktree_manager(&temp);

        state.upsert_work_item(9, "t", "b").await.unwrap();
        state.claim_work_item(9, "a1").await.unwrap();
        state.record_pr_created(9, 90).await.unwrap();

        let mut run = AgentRun::new_running("a1".to_string(), AgentKind::Implement);
        run.work_item_number = Some(9);
        run.pid = Some(DEAD_PID);
        state.create_agent_run(run).await.unwrap();

        recover(&state, &worktrees).await.unwrap();

        // pr_created is preserved; only in_progress items without a PR reset
        let item = state.get_work_item(9).await.unwrap().unwrap();
        assert_eq!(item.status, crate::domain::WorkItemStatus::PrCreated);
    }

    #[test]
    fn test_is_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(DEAD_PID));
    }
}
