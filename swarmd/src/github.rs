//! Hosting-service adapter
//!
//! All GitHub access goes through the `gh` CLI; the orchestrator never talks
//! HTTP itself. Review threads come from the GraphQL thread API when it
//! works (file, line, author, resolution state) and degrade to a raw
//! review-comment count synthesized into a single thread when it does not.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("gh command failed: {0}")]
    CommandFailed(String),

    #[error("failed to run gh: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected gh output: {0}")]
    Parse(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An open issue bearing the automation label
#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

/// Pull request state relevant to the monitor
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: i64,
    pub state: String,
    pub merged: bool,
    pub head_ref: String,
}

/// Normalized CI bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Some check still running, or none have appeared yet
    Pending,
    /// All checks terminal and green
    Passed,
    /// At least one check failed or errored
    Failed,
}

/// One unresolved review thread
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct ReviewThread {
    pub path: Option<String>,
    pub line: Option<i64>,
    pub author: String,
    pub body: String,
}

/// Normalized view over both thread interfaces
#[derive(Debug, Clone, Default)]
pub struct ThreadsView {
    pub unresolved: Vec<ReviewThread>,
    /// True when thread data was unavailable and the count is a heuristic
    pub fallback: bool,
    /// Unresolved-thread count, or raw review-comment count on fallback
    pub comment_count: u32,
}

impl ThreadsView {
    /// Full-fidelity view from the thread API
    pub fn from_threads(unresolved: Vec<ReviewThread>) -> Self {
        let comment_count = unresolved.len() as u32;
        Self {
            unresolved,
            fallback: false,
            comment_count,
        }
    }

    /// Degraded view: a raw comment count synthesized into one thread
    pub fn from_comment_count(count: u32) -> Self {
        let unresolved = if count > 0 {
            vec![ReviewThread {
                path: None,
                line: None,
                author: "unknown".to_string(),
                body: format!("{count} review comments (thread data unavailable)"),
            }]
        } else {
            Vec::new()
        };
        Self {
            unresolved,
            fallback: true,
            comment_count: count,
        }
    }

    /// True when there is review feedback to act on
    pub fn has_feedback(&self) -> bool {
        self.comment_count > 0
    }

    /// JSON snapshot for the review_iterations table; absent on fallback
    pub fn snapshot_json(&self) -> Option<String> {
        if self.fallback {
            return None;
        }
        serde_json::to_string(&self.unresolved).ok()
    }
}

/// The hosting-service seam; tests substitute a scripted implementation
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn list_open_issues(&self, label: &str) -> Result<Vec<Issue>, GithubError>;
    async fn issue_comments(&self, number: i64) -> Result<Vec<String>, GithubError>;
    async fn find_open_pr_by_branch(&self, branch: &str) -> Result<Option<i64>, GithubError>;
    async fn pr_info(&self, number: i64) -> Result<PullRequest, GithubError>;
    async fn unresolved_threads(&self, number: i64) -> Result<ThreadsView, GithubError>;
    async fn check_status(&self, number: i64) -> Result<CheckStatus, GithubError>;
    async fn create_pr(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<i64, GithubError>;
    async fn add_label(&self, issue_number: i64, label: &str) -> Result<(), GithubError>;
}

/// HostClient backed by the `gh` CLI
pub struct GhCli {
    repo: String,
    token: String,
}

impl GhCli {
    pub fn new(repo: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            token: token.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, GithubError> {
        debug!(?args, "gh: invoking");
        let output = Command::new("gh")
            .args(args)
            .env("GH_TOKEN", &self.token)
            .output()
            .await?;
        if !output.status.success() {
            return Err(GithubError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn owner(&self) -> &str {
        self.repo.split('/').next().unwrap_or(&self.repo)
    }

    fn name(&self) -> &str {
        self.repo.rsplit('/').next().unwrap_or(&self.repo)
    }
}

#[async_trait]
impl HostClient for GhCli {
    async fn list_open_issues(&self, label: &str) -> Result<Vec<Issue>, GithubError> {
        let stdout = self
            .run(&[
                "issue",
                "list",
                "--repo",
                &self.repo,
                "--label",
                label,
                "--state",
                "open",
                "--limit",
                "100",
                "--json",
                "number,title,body",
            ])
            .await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn issue_comments(&self, number: i64) -> Result<Vec<String>, GithubError> {
        #[derive(Deserialize)]
        struct CommentsPayload {
            #[serde(default)]
            comments: Vec<Comment>,
        }
        #[derive(Deserialize)]
        struct Comment {
            #[serde(default)]
            body: String,
        }

        let stdout = self
            .run(&["issue", "view", &number.to_string(), "--repo", &self.repo, "--json", "comments"])
            .await?;
        let payload: CommentsPayload = serde_json::from_str(&stdout)?;
        Ok(payload.comments.into_iter().map(|c| c.body).collect())
    }

    async fn find_open_pr_by_branch(&self, branch: &str) -> Result<Option<i64>, GithubError> {
        #[derive(Deserialize)]
        struct PrNumber {
            number: i64,
        }

        let stdout = self
            .run(&[
                "pr", "list", "--repo", &self.repo, "--head", branch, "--state", "open", "--json", "number",
            ])
            .await?;
        let prs: Vec<PrNumber> = serde_json::from_str(&stdout)?;
        Ok(prs.first().map(|pr| pr.number))
    }

    async fn pr_info(&self, number: i64) -> Result<PullRequest, GithubError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PrPayload {
            number: i64,
            state: String,
            merged_at: Option<String>,
            head_ref_name: String,
        }

        let stdout = self
            .run(&[
                "pr",
                "view",
                &number.to_string(),
                "--repo",
                &self.repo,
                "--json",
                "number,state,mergedAt,headRefName",
            ])
            .await?;
        let payload: PrPayload = serde_json::from_str(&stdout)?;
        Ok(PullRequest {
            number: payload.number,
            merged: payload.state == "MERGED" || payload.merged_at.is_some(),
            state: payload.state,
            head_ref: payload.head_ref_name,
        })
    }

    async fn unresolved_threads(&self, number: i64) -> Result<ThreadsView, GithubError> {
        const QUERY: &str = "query($owner:String!,$name:String!,$number:Int!){\
            repository(owner:$owner,name:$name){pullRequest(number:$number){\
            reviewThreads(first:100){nodes{isResolved path line \
            comments(first:1){nodes{author{login} body}}}}}}}";

        let result = self
            .run(&[
                "api",
                "graphql",
                "-f",
                &format!("query={QUERY}"),
                "-F",
                &format!("owner={}", self.owner()),
                "-F",
                &format!("name={}", self.name()),
                "-F",
                &format!("number={number}"),
            ])
            .await;

        match result {
            Ok(stdout) => {
                let json: Value = serde_json::from_str(&stdout)?;
                Ok(ThreadsView::from_threads(threads_from_graphql(&json)?))
            }
            Err(e) => {
                // Thread API unavailable: heuristic count of all review
                // comments, synthesized into one thread
                warn!(pr = number, error = %e, "thread API failed, falling back to comment count");
                let stdout = self
                    .run(&["api", &format!("repos/{}/pulls/{number}/comments", self.repo)])
                    .await?;
                let comments: Vec<Value> = serde_json::from_str(&stdout)?;
                Ok(ThreadsView::from_comment_count(comments.len() as u32))
            }
        }
    }

    async fn check_status(&self, number: i64) -> Result<CheckStatus, GithubError> {
        // `gh pr checks` exits non-zero when checks are pending or failing,
        // so the exit code is not a transport error here; parse stdout.
        let output = Command::new("gh")
            .args(["pr", "checks", &number.to_string(), "--repo", &self.repo, "--json", "state"])
            .env("GH_TOKEN", &self.token)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no checks") {
                return Ok(CheckStatus::Pending);
            }
            return Err(GithubError::CommandFailed(stderr.to_string()));
        }

        #[derive(Deserialize)]
        struct Check {
            #[serde(default)]
            state: String,
        }
        let checks: Vec<Check> = serde_json::from_str(&stdout)?;
        let states: Vec<String> = checks.into_iter().map(|c| c.state).collect();
        Ok(bucket_from_checks(&states))
    }

    async fn create_pr(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<i64, GithubError> {
        let stdout = self
            .run(&[
                "pr", "create", "--repo", &self.repo, "--head", branch, "--base", base, "--title", title, "--body",
                body,
            ])
            .await?;
        parse_pr_url(&stdout).ok_or_else(|| GithubError::Parse(format!("no PR number in gh output: {stdout}")))
    }

    async fn add_label(&self, issue_number: i64, label: &str) -> Result<(), GithubError> {
        self.run(&[
            "issue",
            "edit",
            &issue_number.to_string(),
            "--repo",
            &self.repo,
            "--add-label",
            label,
        ])
        .await?;
        Ok(())
    }
}

/// Extract unresolved threads from the GraphQL response
fn threads_from_graphql(json: &Value) -> Result<Vec<ReviewThread>, GithubError> {
    let nodes = json
        .pointer("/data/repository/pullRequest/reviewThreads/nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| GithubError::Parse("missing reviewThreads in GraphQL response".to_string()))?;

    let mut threads = Vec::new();
    for node in nodes {
        if node.get("isResolved").and_then(Value::as_bool).unwrap_or(true) {
            continue;
        }
        let first_comment = node.pointer("/comments/nodes/0");
        threads.push(ReviewThread {
            path: node.get("path").and_then(Value::as_str).map(str::to_string),
            line: node.get("line").and_then(Value::as_i64),
            author: first_comment
                .and_then(|c| c.pointer("/author/login"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            body: first_comment
                .and_then(|c| c.get("body"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(threads)
}

/// Normalize raw check states into a bucket
///
/// A failure is terminal information even while other checks are running, so
/// it outranks pending.
fn bucket_from_checks(states: &[String]) -> CheckStatus {
    if states.is_empty() {
        return CheckStatus::Pending;
    }
    let mut pending = false;
    for state in states {
        match state.to_uppercase().as_str() {
            "FAILURE" | "ERROR" => return CheckStatus::Failed,
            "SUCCESS" | "NEUTRAL" | "SKIPPED" => {}
            _ => pending = true,
        }
    }
    if pending { CheckStatus::Pending } else { CheckStatus::Passed }
}

/// Pull the PR number out of a `gh pr create` URL
pub fn parse_pr_url(text: &str) -> Option<i64> {
    let re = regex::Regex::new(r"/pull/(\d+)").ok()?;
    re.captures_iter(text).last()?.get(1)?.as_str().parse().ok()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pr_url() {
        assert_eq!(parse_pr_url("https://github.com/octo/widgets/pull/99\n"), Some(99));
        assert_eq!(
            parse_pr_url("Creating pull request...\nhttps://github.com/octo/widgets/pull/123"),
            Some(123)
        );
        assert_eq!(parse_pr_url("no url here"), None);
    }

    #[test]
    fn test_bucket_empty_is_pending() {
        assert_eq!(bucket_from_checks(&[]), CheckStatus::Pending);
    }

    #[test]
    fn test_bucket_all_green_is_passed() {
        let states = vec!["SUCCESS".to_string(), "SKIPPED".to_string()];
        assert_eq!(bucket_from_checks(&states), CheckStatus::Passed);
    }

    #[test]
    fn test_bucket_any_failure_is_failed() {
        let states = vec!["SUCCESS".to_string(), "FAILURE".to_string()];
        assert_eq!(bucket_from_checks(&states), CheckStatus::Failed);

        let states = vec!["PENDING".to_string(), "ERROR".to_string()];
        assert_eq!(bucket_from_checks(&states), CheckStatus::Failed);
    }

    #[test]
    fn test_bucket_running_is_pending() {
        let states = vec!["SUCCESS".to_string(), "IN_PROGRESS".to_string()];
        assert_eq!(bucket_from_checks(&states), CheckStatus::Pending);
    }

    #[test]
    fn test_threads_from_graphql() {
        let json: Value = serde_json::from_str(
            r#"{"data":{"repository":{"pullRequest":{"reviewThreads":{"nodes":[
                {"isResolved":false,"path":"src/lib.rs","line":10,
                 "comments":{"nodes":[{"author":{"login":"alice"},"body":"rename this"}]}},
                {"isResolved":true,"path":"src/main.rs","line":5,
                 "comments":{"nodes":[{"author":{"login":"bob"},"body":"done"}]}},
                {"isResolved":false,"path":null,"line":null,
                 "comments":{"nodes":[]}}
            ]}}}}}"#,
        )
        .unwrap();

        let threads = threads_from_graphql(&json).unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].path.as_deref(), Some("src/lib.rs"));
        assert_eq!(threads[0].line, Some(10));
        assert_eq!(threads[0].author, "alice");
        assert_eq!(threads[0].body, "rename this");
        assert_eq!(threads[1].author, "unknown");
    }

    #[test]
    fn test_threads_from_graphql_missing_data() {
        let json: Value = serde_json::from_str(r#"{"errors":[{"message":"boom"}]}"#).unwrap();
        assert!(threads_from_graphql(&json).is_err());
    }

    #[test]
    fn test_threads_view_snapshot() {
        let view = ThreadsView::from_threads(vec![ReviewThread {
            path: Some("a.rs".to_string()),
            line: Some(1),
            author: "alice".to_string(),
            body: "fix".to_string(),
        }]);
        assert_eq!(view.comment_count, 1);
        assert!(view.has_feedback());
        assert!(view.snapshot_json().unwrap().contains("a.rs"));
    }

    #[test]
    fn test_threads_view_fallback_synthesizes_one_thread() {
        let view = ThreadsView::from_comment_count(12);
        assert!(view.fallback);
        assert_eq!(view.comment_count, 12);
        assert_eq!(view.unresolved.len(), 1);
        assert!(view.unresolved[0].body.contains("12 review comments"));
        assert_eq!(view.snapshot_json(), None);

        let empty = ThreadsView::from_comment_count(0);
        assert!(!empty.has_feedback());
        assert!(empty.unresolved.is_empty());
    }
}
