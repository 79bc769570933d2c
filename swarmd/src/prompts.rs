//! Prompt composition
//!
//! A single pure builder renders every prompt the orchestrator sends to
//! agents from embedded handlebars templates and a structured context. No
//! I/O, no globals; everything the template needs arrives in the context.

use eyre::{Context as _, Result};
use handlebars::Handlebars;
use serde::Serialize;

use crate::github::ReviewThread;

/// Compiled into the binary from .pmt files
mod embedded {
    pub const IMPLEMENT: &str = include_str!("../prompts/implement.pmt");
    pub const FIX: &str = include_str!("../prompts/fix.pmt");
    pub const RESUME: &str = include_str!("../prompts/resume.pmt");
}

/// One-shot availability probe sent by the rate-limit watcher
pub const PROBE_PROMPT: &str = "Reply with OK.";

/// Context for an implement prompt
#[derive(Debug, Clone, Serialize)]
pub struct ImplementContext {
    pub issue_number: i64,
    pub title: String,
    pub body: String,
    pub branch: String,
    pub base_branch: String,
    pub max_turns: u32,
    /// Installed capability names; empty renders no hint
    pub skills: Vec<String>,
    /// Set on re-dispatch after a failed attempt
    pub retry_hint: Option<String>,
}

/// Context for a fix prompt
#[derive(Debug, Clone, Serialize)]
pub struct FixContext {
    pub pr_number: i64,
    pub branch: String,
    pub max_turns: u32,
    pub ci_failed: bool,
    pub threads: Vec<ReviewThread>,
    pub skills: Vec<String>,
}

/// Context for a resume prompt after a rate limit
#[derive(Debug, Clone, Serialize)]
pub struct ResumeContext {
    pub task_description: String,
    pub is_fix: bool,
    pub issue_number: Option<i64>,
    pub pr_number: Option<i64>,
    pub branch: String,
}

impl ResumeContext {
    pub fn for_implement(issue_number: i64, branch: String) -> Self {
        Self {
            task_description: format!("implementing issue #{issue_number}"),
            is_fix: false,
            issue_number: Some(issue_number),
            pr_number: None,
            branch,
        }
    }

    pub fn for_fix(pr_number: i64, branch: String) -> Self {
        Self {
            task_description: format!("fixing review feedback on PR #{pr_number}"),
            is_fix: true,
            issue_number: None,
            pr_number: Some(pr_number),
            branch,
        }
    }
}

/// Renders prompts from the embedded templates
pub struct PromptBuilder {
    hbs: Handlebars<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut hbs = Handlebars::new();
        // Prompts are plain text, not HTML
        hbs.register_escape_fn(handlebars::no_escape);
        hbs.register_template_string("implement", embedded::IMPLEMENT)
            .context("invalid implement template")?;
        hbs.register_template_string("fix", embedded::FIX)
            .context("invalid fix template")?;
        hbs.register_template_string("resume", embedded::RESUME)
            .context("invalid resume template")?;
        Ok(Self { hbs })
    }

    pub fn implement(&self, ctx: &ImplementContext) -> Result<String> {
        self.hbs.render("implement", ctx).context("failed to render implement prompt")
    }

    pub fn fix(&self, ctx: &FixContext) -> Result<String> {
        self.hbs.render("fix", ctx).context("failed to render fix prompt")
    }

    pub fn resume(&self, ctx: &ResumeContext) -> Result<String> {
        self.hbs.render("resume", ctx).context("failed to render resume prompt")
    }

    pub fn probe(&self) -> &'static str {
        PROBE_PROMPT
    }
}
