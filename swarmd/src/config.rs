//! Swarmd configuration
//!
//! All configuration comes from the environment; the orchestrator is designed
//! to run under a service manager that owns the env file.

use std::path::PathBuf;

use eyre::{Context, Result, eyre};

/// Tools granted to implement/fix agents. The capability-invocation tool is
/// appended when skills are enabled.
const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Bash", "Read", "Write", "Edit", "Glob", "Grep", "WebFetch"];

/// Main swarmd configuration, sourced from the environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent-program OAuth token, passed through to children
    pub claude_token: String,

    /// Hosting-service PAT, consumed by the `gh` CLI
    pub gh_token: String,

    /// `owner/name` of the target repository
    pub github_repo: String,

    /// Absolute path to the local clone
    pub target_repo_path: PathBuf,

    /// Branch agents fork from
    pub base_branch: String,

    /// Hard ceiling on concurrently running agents
    pub max_concurrent_agents: u32,

    /// Prompt-advertised turn budget for implement agents
    pub max_turns_implement: u32,

    /// Prompt-advertised turn budget for fix agents
    pub max_turns_fix: u32,

    /// Hard per-agent wall-clock ceiling in seconds
    pub agent_timeout_secs: u64,

    /// Issue-poll cadence in seconds
    pub poll_interval_secs: u64,

    /// PR-poll cadence in seconds
    pub pr_poll_interval_secs: u64,

    /// Label required on issues
    pub issue_label: String,

    /// Required mention in issue comments; empty disables the gate
    pub trigger_mention: String,

    /// Implement-attempt ceiling per work item
    pub max_issue_retries: u32,

    /// Fix-iteration ceiling per PR
    pub max_pr_fix_retries: u32,

    /// Rate-limit watcher cadence in seconds
    pub rate_limit_retry_interval: u64,

    /// Per-run resume ceiling
    pub max_rate_limit_resumes: u32,

    /// Toggles capability discovery and hint injection
    pub skills_enabled: bool,

    /// Directory scanned for installed capabilities
    pub skills_dir: PathBuf,

    /// Worktree root directory
    pub worktree_dir: PathBuf,

    /// State-store location
    pub db_path: PathBuf,

    /// Dashboard HTTP port
    pub dashboard_port: u16,

    /// Agent program invoked for each run
    pub agent_command: String,
}

impl Config {
    /// Load configuration from the environment
    ///
    /// Fails with an actionable message on the first missing required
    /// variable; loops must not be started on error.
    pub fn from_env() -> Result<Self> {
        let claude_token = required("CLAUDE_CODE_OAUTH_TOKEN")?;
        let gh_token = required("GH_TOKEN")?;
        let github_repo = required("GITHUB_REPO")?;
        let target_repo_path = PathBuf::from(required("TARGET_REPO_PATH")?);

        if !github_repo.contains('/') {
            return Err(eyre!("GITHUB_REPO must be in owner/name form, got '{}'", github_repo));
        }

        let worktree_dir = match std::env::var("WORKTREE_DIR") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => default_worktree_dir(&target_repo_path),
        };

        let skills_dir = match std::env::var("SKILLS_DIR") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".claude").join("skills")
            }
        };

        Ok(Self {
            claude_token,
            gh_token,
            github_repo,
            target_repo_path,
            base_branch: string_or("BASE_BRANCH", "main"),
            max_concurrent_agents: parse_or("MAX_CONCURRENT_AGENTS", 3)?,
            max_turns_implement: parse_or("AGENT_MAX_TURNS_IMPLEMENT", 30)?,
            max_turns_fix: parse_or("AGENT_MAX_TURNS_FIX", 20)?,
            agent_timeout_secs: parse_or("AGENT_TIMEOUT_SECONDS", 1800)?,
            poll_interval_secs: parse_or("POLL_INTERVAL_SECONDS", 300)?,
            pr_poll_interval_secs: parse_or("PR_POLL_INTERVAL_SECONDS", 120)?,
            issue_label: string_or("ISSUE_LABEL", "agent"),
            trigger_mention: std::env::var("TRIGGER_MENTION").unwrap_or_else(|_| "@claude-swarm".to_string()),
            max_issue_retries: parse_or("MAX_ISSUE_RETRIES", 3)?,
            max_pr_fix_retries: parse_or("MAX_PR_FIX_RETRIES", 5)?,
            rate_limit_retry_interval: parse_or("RATE_LIMIT_RETRY_INTERVAL", 300)?,
            max_rate_limit_resumes: parse_or("MAX_RATE_LIMIT_RESUMES", 5)?,
            skills_enabled: bool_or("SKILLS_ENABLED", true)?,
            skills_dir,
            worktree_dir,
            db_path: PathBuf::from(string_or("DB_PATH", "orchestrator/swarm.db")),
            dashboard_port: parse_or("DASHBOARD_PORT", 8420)?,
            agent_command: string_or("AGENT_COMMAND", "claude"),
        })
    }

    /// Allowed-tool set for agent invocations
    pub fn allowed_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect();
        if self.skills_enabled {
            tools.push("Skill".to_string());
        }
        tools
    }

    /// Repository name component of `owner/name`
    pub fn repo_name(&self) -> &str {
        self.github_repo.rsplit('/').next().unwrap_or(&self.github_repo)
    }

    /// Repository owner component of `owner/name`
    pub fn repo_owner(&self) -> &str {
        self.github_repo.split('/').next().unwrap_or(&self.github_repo)
    }

    /// Configuration summary with tokens masked, for startup logging
    pub fn redacted(&self) -> String {
        format!(
            "repo={} repo_path={} base={} max_agents={} timeout={}s poll={}s pr_poll={}s \
             label={} mention={:?} issue_retries={} pr_fix_retries={} skills={} \
             worktrees={} db={} dashboard_port={} claude_token=*** gh_token=***",
            self.github_repo,
            self.target_repo_path.display(),
            self.base_branch,
            self.max_concurrent_agents,
            self.agent_timeout_secs,
            self.poll_interval_secs,
            self.pr_poll_interval_secs,
            self.issue_label,
            self.trigger_mention,
            self.max_issue_retries,
            self.max_pr_fix_retries,
            self.skills_enabled,
            self.worktree_dir.display(),
            self.db_path.display(),
            self.dashboard_port,
        )
    }

    /// Verify the environment is usable before starting any loop
    ///
    /// Checks that the target repository exists and is a git repository, and
    /// that the `git` and `gh` CLIs are resolvable.
    pub fn preflight(&self) -> Result<()> {
        if !self.target_repo_path.exists() {
            return Err(eyre!(
                "TARGET_REPO_PATH {} does not exist",
                self.target_repo_path.display()
            ));
        }
        if !self.target_repo_path.join(".git").exists() {
            return Err(eyre!(
                "TARGET_REPO_PATH {} is not a git repository (no .git)",
                self.target_repo_path.display()
            ));
        }

        for tool in ["git", "gh"] {
            let status = std::process::Command::new(tool)
                .arg("--version")
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
            match status {
                Ok(s) if s.success() => {}
                _ => return Err(eyre!("required CLI '{}' is not on PATH", tool)),
            }
        }

        let status = std::process::Command::new("gh")
            .args(["auth", "status"])
            .env("GH_TOKEN", &self.gh_token)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => {}
            _ => {
                return Err(eyre!(
                    "gh is not authenticated; check GH_TOKEN (`gh auth status` for details)"
                ));
            }
        }

        Ok(())
    }
}

/// Default worktree root: sibling of the target clone
fn default_worktree_dir(target_repo: &PathBuf) -> PathBuf {
    let name = target_repo
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    target_repo
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!("{name}-worktrees"))
}

fn required(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(eyre!("required environment variable {} is not set", name)),
    }
}

fn string_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v.parse().context(format!("invalid value for {name}")),
        _ => Ok(default),
    }
}

fn bool_or(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(eyre!("invalid boolean for {}: '{}'", name, other)),
        },
        _ => Ok(default),
    }
}
