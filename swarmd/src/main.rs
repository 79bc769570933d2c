//! Swarmd - issue-to-PR agent swarm orchestrator
//!
//! CLI entry point: configuration, preflight, startup recovery, and the
//! wiring between the control loops.

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result, eyre};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use swarmd::cli::{Cli, Command};
use swarmd::config::Config;
use swarmd::github::{GhCli, HostClient};
use swarmd::prompts::PromptBuilder;
use swarmd::store::StateManager;
use swarmd::worktree::{WorktreeConfig, WorktreeManager};
use swarmd::{AgentPool, IssuePoller, PrMonitor, dashboard, store};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    // Precedence: CLI flag > RUST_LOG > INFO
    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: unknown log-level '{other}', defaulting to INFO");
            tracing::Level::INFO
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref()).context("failed to setup logging")?;

    match cli.command {
        Some(Command::Status) => cmd_status().await,
        Some(Command::Check) => cmd_check(),
        Some(Command::Run) | None => cmd_run().await,
    }
}

/// Validate configuration and environment, then exit
fn cmd_check() -> Result<()> {
    let config = Config::from_env().context("configuration error")?;
    config.preflight().context("preflight failed")?;
    println!("environment OK: {}", config.redacted());
    Ok(())
}

/// Print aggregate counters without starting any loop
async fn cmd_status() -> Result<()> {
    let config = Config::from_env().context("configuration error")?;
    let state = StateManager::spawn(&config.db_path).map_err(|e| eyre!("{e}"))?;
    let metrics = state.metrics().await.map_err(|e| eyre!("{e}"))?;

    println!("work items:");
    println!("  pending      {}", metrics.pending);
    println!("  in progress  {}", metrics.in_progress);
    println!("  open PRs     {}", metrics.pr_created);
    println!("  resolved     {}", metrics.resolved);
    println!("  needs human  {}", metrics.needs_human);
    println!("agents:");
    println!("  running      {}", metrics.running_agents);
    println!("  rate limited {}", metrics.rate_limited_agents);
    println!("  avg turns    {:.1}", metrics.avg_turns);

    state.shutdown().await;
    Ok(())
}

/// Run the orchestrator until a termination signal arrives
async fn cmd_run() -> Result<()> {
    let config = Config::from_env().context("configuration error")?;
    config.preflight().context("preflight failed")?;
    info!("starting swarmd: {}", config.redacted());

    let state = StateManager::spawn(&config.db_path).map_err(|e| eyre!("{e}"))?;
    let worktrees = WorktreeManager::new(WorktreeConfig {
        repo_root: config.target_repo_path.clone(),
        base_dir: config.worktree_dir.clone(),
        base_branch: config.base_branch.clone(),
    });

    // Reconcile detached agents and stale worktrees before any dispatch
    let stats = store::recover(&state, &worktrees).await?;
    info!("startup recovery: {}", stats);

    let host: Arc<dyn HostClient> = Arc::new(GhCli::new(config.github_repo.clone(), config.gh_token.clone()));
    let prompts = PromptBuilder::new()?;

    let (dispatch_tx, dispatch_rx) = mpsc::channel(64);
    let (pool_shutdown_tx, pool_shutdown_rx) = mpsc::channel(1);
    let (poller_shutdown_tx, poller_shutdown_rx) = mpsc::channel(1);
    let (monitor_shutdown_tx, monitor_shutdown_rx) = mpsc::channel(1);
    let (dashboard_shutdown_tx, dashboard_shutdown_rx) = mpsc::channel(1);

    let pool = AgentPool::new(
        config.clone(),
        state.clone(),
        worktrees.clone(),
        host.clone(),
        prompts,
    );
    let poller = IssuePoller::new(config.clone(), state.clone(), host.clone(), dispatch_tx.clone());
    let monitor = PrMonitor::new(config.clone(), state.clone(), host.clone(), dispatch_tx);

    let pool_task = tokio::spawn(pool.run(dispatch_rx, pool_shutdown_rx));
    let poller_task = tokio::spawn(poller.run(poller_shutdown_rx));
    let monitor_task = tokio::spawn(monitor.run(monitor_shutdown_rx));

    let dashboard_state = state.clone();
    let dashboard_port = config.dashboard_port;
    let dashboard_task = tokio::spawn(async move {
        if let Err(e) = dashboard::serve(dashboard_port, dashboard_state, dashboard_shutdown_rx).await {
            error!(error = %e, "dashboard server failed");
        }
    });

    wait_for_shutdown_signal().await;
    info!("shutdown requested: stopping intake loops, leaving agents running");

    let _ = poller_shutdown_tx.send(()).await;
    let _ = monitor_shutdown_tx.send(()).await;
    let _ = pool_shutdown_tx.send(()).await;
    let _ = dashboard_shutdown_tx.send(()).await;

    let _ = poller_task.await;
    let _ = monitor_task.await;
    let _ = pool_task.await;
    let _ = dashboard_task.await;

    state.shutdown().await;
    info!("swarmd stopped");
    Ok(())
}

/// Block until SIGINT or SIGTERM
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        Err(e) => {
            warn!(error = %e, "could not install SIGTERM handler, watching SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
