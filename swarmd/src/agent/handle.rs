//! Agent process handles
//!
//! A handle owns everything attached to one live agent: the child process,
//! the stdout event reader, the stderr rate-limit scanner, and the timeout.
//! `wait` reaps the child and both readers independently and returns a
//! single tagged outcome.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use eyre::{Context, Result, eyre};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{IngestSummary, ingest_stdout, scan_stderr};
use crate::store::StateManager;

/// Grace window between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(10);

/// How long to wait for the readers after the child is gone; the pool uses
/// the same window to drain supervision tasks at shutdown
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to spawn one agent process
#[derive(Debug, Clone)]
pub struct AgentSpawnSpec {
    pub agent_id: String,
    pub prompt: String,
    pub worktree: PathBuf,
    pub allowed_tools: Vec<String>,
    /// Attach to a prior session when resuming
    pub session_id: Option<String>,
    /// Generic continuation when resuming without a session id
    pub continue_session: bool,
    pub max_turns: Option<u32>,
}

impl AgentSpawnSpec {
    pub fn new(agent_id: String, prompt: String, worktree: PathBuf, allowed_tools: Vec<String>) -> Self {
        Self {
            agent_id,
            prompt,
            worktree,
            allowed_tools,
            session_id: None,
            continue_session: false,
            max_turns: None,
        }
    }
}

/// Tagged outcome of a supervised agent run
#[derive(Debug)]
pub enum AgentOutcome {
    /// Exit code zero
    Completed { summary: IngestSummary },
    /// Non-zero exit, spawn failure, or wait failure
    Failed { error: String, summary: IngestSummary },
    /// Wall-clock ceiling exceeded; the process was terminated
    Timeout { summary: IngestSummary },
    /// A rate-limit signal was seen; the process was stopped if still live
    RateLimited { summary: IngestSummary },
}

/// A live agent process and its attached reader tasks
pub struct AgentHandle {
    pub agent_id: String,
    pub pid: u32,
    child: Child,
    stdout_task: JoinHandle<IngestSummary>,
    stderr_task: JoinHandle<u32>,
    rate_limit_rx: mpsc::Receiver<()>,
}

impl AgentHandle {
    /// Spawn the agent program detached in its worktree
    ///
    /// The child gets its own process group, so orchestrator restarts do not
    /// take running agents down; recovery re-attaches by pid.
    pub fn spawn(spec: &AgentSpawnSpec, config: &Config, state: StateManager) -> Result<Self> {
        debug!(agent_id = %spec.agent_id, worktree = %spec.worktree.display(), "spawning agent");

        let mut cmd = Command::new(&config.agent_command);
        cmd.arg("-p")
            .arg(&spec.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--allowed-tools")
            .arg(spec.allowed_tools.join(","));
        if let Some(turns) = spec.max_turns {
            cmd.arg("--max-turns").arg(turns.to_string());
        }
        if let Some(session_id) = &spec.session_id {
            cmd.arg("--resume").arg(session_id);
        } else if spec.continue_session {
            cmd.arg("--continue");
        }
        cmd.current_dir(&spec.worktree)
            .env("CLAUDE_CODE_OAUTH_TOKEN", &config.claude_token)
            .env("GH_TOKEN", &config.gh_token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .context(format!("failed to spawn agent program '{}'", config.agent_command))?;
        let pid = child.id().ok_or_else(|| eyre!("spawned agent has no pid"))?;

        let stdout = child.stdout.take().ok_or_else(|| eyre!("agent stdout not captured"))?;
        let stderr = child.stderr.take().ok_or_else(|| eyre!("agent stderr not captured"))?;

        // Both readers feed the same channel: a rate-limit signal from either
        // stream must stop a still-live child
        let (rate_limit_tx, rate_limit_rx) = mpsc::channel(4);

        let stdout_task = {
            let agent_id = spec.agent_id.clone();
            let state = state.clone();
            let notify = rate_limit_tx.clone();
            tokio::spawn(async move { ingest_stdout(stdout, &agent_id, state, notify).await })
        };
        let stderr_task = {
            let agent_id = spec.agent_id.clone();
            tokio::spawn(async move { scan_stderr(stderr, &agent_id, state, rate_limit_tx).await })
        };

        info!(agent_id = %spec.agent_id, pid, "agent spawned");
        Ok(Self {
            agent_id: spec.agent_id.clone(),
            pid,
            child,
            stdout_task,
            stderr_task,
            rate_limit_rx,
        })
    }

    /// Supervise until exit, rate limit, or timeout
    pub async fn wait(mut self, timeout: Duration) -> AgentOutcome {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            status = self.child.wait() => {
                let (summary, stderr_hits) = self.drain().await;
                match status {
                    Ok(status) => {
                        if summary.saw_rate_limit || stderr_hits > 0 {
                            AgentOutcome::RateLimited { summary }
                        } else if status.success() {
                            AgentOutcome::Completed { summary }
                        } else {
                            AgentOutcome::Failed {
                                error: format!("agent exited with {status}"),
                                summary,
                            }
                        }
                    }
                    Err(e) => AgentOutcome::Failed {
                        error: format!("failed to reap agent: {e}"),
                        summary,
                    },
                }
            }
            // Arm disabled once both readers have closed the channel
            Some(_) = self.rate_limit_rx.recv() => {
                info!(agent_id = %self.agent_id, "rate limit signalled, stopping agent");
                self.terminate().await;
                let (summary, _) = self.drain().await;
                AgentOutcome::RateLimited { summary }
            }
            _ = &mut deadline => {
                warn!(agent_id = %self.agent_id, "agent exceeded wall-clock ceiling, terminating");
                self.terminate().await;
                let (summary, _) = self.drain().await;
                AgentOutcome::Timeout { summary }
            }
        }
    }

    /// SIGTERM, grace window, then SIGKILL
    async fn terminate(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.pid as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!(agent_id = %self.agent_id, error = %e, "SIGTERM failed (process likely gone)");
        }

        match tokio::time::timeout(KILL_GRACE, self.child.wait()).await {
            Ok(_) => debug!(agent_id = %self.agent_id, "agent exited after SIGTERM"),
            Err(_) => {
                warn!(agent_id = %self.agent_id, "agent ignored SIGTERM, sending SIGKILL");
                let _ = kill(pid, Signal::SIGKILL);
                let _ = self.child.wait().await;
            }
        }
    }

    /// Reap both readers; the child is already gone so the streams close
    async fn drain(&mut self) -> (IngestSummary, u32) {
        let summary = match tokio::time::timeout(DRAIN_TIMEOUT, &mut self.stdout_task).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                warn!(agent_id = %self.agent_id, error = %e, "stdout reader panicked");
                IngestSummary::default()
            }
            Err(_) => {
                warn!(agent_id = %self.agent_id, "stdout reader did not drain in time");
                self.stdout_task.abort();
                IngestSummary::default()
            }
        };
        let stderr_hits = match tokio::time::timeout(DRAIN_TIMEOUT, &mut self.stderr_task).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(_)) => 0,
            Err(_) => {
                self.stderr_task.abort();
                0
            }
        };
        (summary, stderr_hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp: &TempDir, agent_command: &str) -> Config {
        Config {
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
            trigger_mention: String::new(),
            max_issue_retries: 3,
            max_pr_fix_retries: 5,
            rate_limit_retry_interval: 300,
            max_rate_limit_resumes: 5,
            skills_enabled: false,
            skills_dir: temp.path().join("skills"),
            worktree_dir: temp.path().join("worktrees"),
            db_path: temp.path().join("swarm.db"),
            dashboard_port: 0,
            agent_command: agent_command.to_string(),
        }
    }

    fn spec(temp: &TempDir) -> AgentSpawnSpec {
        AgentSpawnSpec::new(
            "agent-test-1".to_string(),
            "do the thing".to_string(),
            temp.path().to_path_buf(),
            vec!["Bash".to_string()],
        )
    }

    #[tokio::test]
    async fn test_completed_outcome_with_events() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("swarm.db")).unwrap();

        // A stand-in agent that emits two events and exits cleanly
        let script = temp.path().join("agent.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             echo '{\"type\":\"system\",\"session_id\":\"sess-1\"}'\n\
             echo '{\"type\":\"result\",\"pr_number\":5,\"result\":\"ok\"}'\n",
        )
        .unwrap();
        std::process::Command::new("chmod").arg("+x").arg(&script).status().unwrap();

        let config = test_config(&temp, script.to_str().unwrap());
        let handle = AgentHandle::spawn(&spec(&temp), &config, state.clone()).unwrap();
        let outcome = handle.wait(Duration::from_secs(30)).await;

        match outcome {
            AgentOutcome::Completed { summary } => {
                assert_eq!(summary.session_id.as_deref(), Some("sess-1"));
                assert_eq!(summary.pr_number, Some(5));
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let events = state.list_events("agent-test-1", 0).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_outcome_on_nonzero_exit() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("swarm.db")).unwrap();

        let script = temp.path().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        std::process::Command::new("chmod").arg("+x").arg(&script).status().unwrap();

        let config = test_config(&temp, script.to_str().unwrap());
        let handle = AgentHandle::spawn(&spec(&temp), &config, state).unwrap();
        let outcome = handle.wait(Duration::from_secs(30)).await;

        assert!(matches!(outcome, AgentOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_rate_limit_on_stderr_stops_agent() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("swarm.db")).unwrap();

        let run = crate::domain::AgentRun::new_running("agent-test-1".to_string(), crate::domain::AgentKind::Implement);
        state.create_agent_run(run).await.unwrap();

        // Emits a rate-limit signature then lingers; wait() must stop it
        let script = temp.path().join("agent.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'Error: 429 Too Many Requests' >&2\nexec sleep 60\n",
        )
        .unwrap();
        std::process::Command::new("chmod").arg("+x").arg(&script).status().unwrap();

        let config = test_config(&temp, script.to_str().unwrap());
        let handle = AgentHandle::spawn(&spec(&temp), &config, state.clone()).unwrap();
        let outcome = handle.wait(Duration::from_secs(30)).await;

        assert!(matches!(outcome, AgentOutcome::RateLimited { .. }));
        let fetched = state.get_agent_run("agent-test-1").await.unwrap().unwrap();
        assert_eq!(fetched.rate_limit_hits, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_event_on_stdout_stops_agent() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("swarm.db")).unwrap();

        // Emits a rate_limit_event on stdout then lingers; wait() must stop it
        let script = temp.path().join("agent.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"type\":\"rate_limit_event\",\"retry_after\":60}'\nexec sleep 60\n",
        )
        .unwrap();
        std::process::Command::new("chmod").arg("+x").arg(&script).status().unwrap();

        let config = test_config(&temp, script.to_str().unwrap());
        let handle = AgentHandle::spawn(&spec(&temp), &config, state.clone()).unwrap();

        let started = std::time::Instant::now();
        let outcome = handle.wait(Duration::from_secs(30)).await;

        match outcome {
            AgentOutcome::RateLimited { summary } => assert!(summary.saw_rate_limit),
            other => panic!("expected RateLimited, got {other:?}"),
        }
        // The child was terminated, not waited out
        assert!(started.elapsed() < Duration::from_secs(25));
    }

    #[tokio::test]
    async fn test_timeout_terminates_agent() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("swarm.db")).unwrap();

        let script = temp.path().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 60\n").unwrap();
        std::process::Command::new("chmod").arg("+x").arg(&script).status().unwrap();

        let config = test_config(&temp, script.to_str().unwrap());
        let handle = AgentHandle::spawn(&spec(&temp), &config, state).unwrap();

        let started = std::time::Instant::now();
        let outcome = handle.wait(Duration::from_millis(300)).await;
        assert!(matches!(outcome, AgentOutcome::Timeout { .. }));
        // SIGTERM suffices for sleep; no need to ride out the kill grace
        assert!(started.elapsed() < KILL_GRACE);
    }
}
