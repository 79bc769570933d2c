//! Dashboard HTTP surface
//!
//! A thin read-only view over the state store: aggregate metrics, agent runs
//! with incremental logs, tracked work items and review iterations, and one
//! embedded static page. Nothing here mutates state.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::domain::{AgentEvent, AgentRun, ReviewIteration, WorkItem};
use crate::store::{StateError, StateManager, StoreMetrics};

#[derive(Clone)]
struct DashboardState {
    state: StateManager,
}

/// Build the read-only router
pub fn router(state: StateManager) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/metrics", get(metrics))
        .route("/api/agents", get(agents))
        .route("/api/agents/{id}/logs", get(agent_logs))
        .route("/api/issues", get(issues))
        .route("/api/prs", get(prs))
        .with_state(DashboardState { state })
}

/// Serve until the shutdown signal arrives
pub async fn serve(port: u16, state: StateManager, mut shutdown_rx: mpsc::Receiver<()>) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("dashboard: shutdown signal received");
        })
        .await?;
    Ok(())
}

fn internal(e: StateError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../assets/dashboard.html"))
}

async fn metrics(State(ds): State<DashboardState>) -> Result<Json<StoreMetrics>, (StatusCode, String)> {
    ds.state.metrics().await.map(Json).map_err(internal)
}

async fn agents(State(ds): State<DashboardState>) -> Result<Json<Vec<AgentRun>>, (StatusCode, String)> {
    ds.state.list_agent_runs(None).await.map(Json).map_err(internal)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    /// Return events with id greater than this; 0 for everything
    #[serde(default)]
    since: i64,
}

async fn agent_logs(
    State(ds): State<DashboardState>,
    Path(agent_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<AgentEvent>>, (StatusCode, String)> {
    ds.state
        .list_events(&agent_id, query.since)
        .await
        .map(Json)
        .map_err(internal)
}

async fn issues(State(ds): State<DashboardState>) -> Result<Json<Vec<WorkItem>>, (StatusCode, String)> {
    ds.state.list_work_items(None).await.map(Json).map_err(internal)
}

async fn prs(State(ds): State<DashboardState>) -> Result<Json<Vec<ReviewIteration>>, (StatusCode, String)> {
    ds.state.list_iterations(None).await.map(Json).map_err(internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventType;
    use tempfile::TempDir;

    async fn dashboard_state(temp: &TempDir) -> DashboardState {
        DashboardState {
            state: StateManager::spawn(temp.path().join("swarm.db")).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let temp = TempDir::new().unwrap();
        let ds = dashboard_state(&temp).await;
        ds.state.upsert_work_item(1, "t", "b").await.unwrap();

        let Json(metrics) = metrics(State(ds)).await.unwrap();
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.resolved, 0);
    }

    #[tokio::test]
    async fn test_agents_endpoint() {
        let temp = TempDir::new().unwrap();
        let ds = dashboard_state(&temp).await;
        let run = crate::domain::AgentRun::new_running("a1".to_string(), crate::domain::AgentKind::Implement);
        ds.state.create_agent_run(run).await.unwrap();

        let Json(runs) = agents(State(ds)).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].agent_id, "a1");
    }

    #[tokio::test]
    async fn test_agent_logs_incremental() {
        let temp = TempDir::new().unwrap();
        let ds = dashboard_state(&temp).await;
        let first = ds.state.append_event("a1", EventType::System, "{}").await.unwrap();
        ds.state.append_event("a1", EventType::Assistant, "{}").await.unwrap();

        let Json(all) = agent_logs(
            State(ds.clone()),
            Path("a1".to_string()),
            Query(LogsQuery { since: 0 }),
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 2);

        let Json(newer) = agent_logs(State(ds), Path("a1".to_string()), Query(LogsQuery { since: first }))
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
    }

    #[tokio::test]
    async fn test_issues_and_prs_endpoints() {
        let temp = TempDir::new().unwrap();
        let ds = dashboard_state(&temp).await;
        ds.state.upsert_work_item(1, "t", "b").await.unwrap();
        ds.state.upsert_review_iteration(99, 1, 2, None).await.unwrap();

        let Json(items) = issues(State(ds.clone())).await.unwrap();
        assert_eq!(items.len(), 1);

        let Json(iterations) = prs(State(ds)).await.unwrap();
        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0].pr_number, 99);
    }

    #[tokio::test]
    async fn test_index_serves_embedded_page() {
        let Html(page) = index().await;
        assert!(page.contains("swarmd"));
    }
}
