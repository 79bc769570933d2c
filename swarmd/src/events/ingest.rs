//! Event stream ingestion
//!
//! One reader task per live agent consumes stdout line by line, classifies
//! each payload, and appends it to the store in arrival order. A companion
//! scanner watches stderr for rate-limit signatures; both streams relay
//! rate-limit signals to the supervisor over the same notify channel.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::ratelimit;
use crate::domain::EventType;
use crate::store::StateManager;

use super::types::classify;

/// What the reader learned by the time the stream closed
#[derive(Debug, Default, Clone)]
pub struct IngestSummary {
    pub session_id: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_via_fallback: bool,
    /// A rate_limit_event or rate-limit-looking error event was seen
    pub saw_rate_limit: bool,
    /// Count of assistant events (the run's turns_used)
    pub turns: u32,
}

/// Consume the agent's stdout until EOF, appending every event
///
/// Append failures are logged and skipped. A rate_limit_event (or a
/// rate-limit-looking error event) pokes the supervisor through the notify
/// channel, same as a stderr signature hit, so a still-live child is stopped.
pub async fn ingest_stdout<R>(stdout: R, agent_id: &str, state: StateManager, notify: mpsc::Sender<()>) -> IngestSummary
where
    R: AsyncRead + Unpin,
{
    let mut summary = IngestSummary::default();
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(agent_id, error = %e, "ingest: stdout read error, stopping reader");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event = classify(&line);

        // First occurrence wins; persisted once
        if let Some(session_id) = &event.session_id
            && summary.session_id.is_none()
        {
            summary.session_id = Some(session_id.clone());
            if let Err(e) = state.record_agent_session(agent_id, session_id).await {
                warn!(agent_id, error = %e, "ingest: failed to persist session id");
            } else {
                debug!(agent_id, %session_id, "ingest: captured session id");
            }
        }

        if event.event_type == EventType::Assistant {
            summary.turns += 1;
            if let Some(text) = &event.summary {
                info!(agent_id, turn = summary.turns, "{}", text);
            }
        }

        if let Some(pr_number) = event.pr_number {
            summary.pr_number = Some(pr_number);
            summary.pr_via_fallback = event.pr_via_fallback;
        }

        if event.event_type == EventType::RateLimitEvent
            || (event.event_type == EventType::Error && ratelimit::matches(&event.raw))
        {
            info!(agent_id, "rate-limit signal in event stream");
            summary.saw_rate_limit = true;
            // The supervisor only needs one wake-up; drops are fine
            let _ = notify.try_send(());
        }

        if let Err(e) = state.append_event(agent_id, event.event_type, &event.raw).await {
            warn!(agent_id, error = %e, "ingest: failed to append event");
        }
    }

    debug!(agent_id, turns = summary.turns, pr = ?summary.pr_number, "ingest: stream drained");
    summary
}

/// Scan the agent's stderr for rate-limit signatures
///
/// Each hit bumps the run's counter and pokes the supervisor through the
/// notify channel. Returns the total number of hits.
pub async fn scan_stderr<R>(stderr: R, agent_id: &str, state: StateManager, notify: mpsc::Sender<()>) -> u32
where
    R: AsyncRead + Unpin,
{
    let mut hits = 0u32;
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!(agent_id, "agent stderr: {}", line);

        if ratelimit::matches(&line) {
            hits += 1;
            info!(agent_id, %line, "rate-limit signature on stderr");
            if let Err(e) = state.increment_rate_limit_hits(agent_id).await {
                warn!(agent_id, error = %e, "failed to record rate-limit hit");
            }
            // The supervisor only needs one wake-up; drops are fine
            let _ = notify.try_send(());
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn spawn_state(temp: &TempDir) -> StateManager {
        StateManager::spawn(temp.path().join("swarm.db")).unwrap()
    }

    fn notify_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
        mpsc::channel(4)
    }

    #[tokio::test]
    async fn test_ingest_collects_session_turns_and_pr() {
        let temp = TempDir::new().unwrap();
        let state = spawn_state(&temp).await;

        let stream = concat!(
            "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"sess-1\"}\n",
            "{\"type\":\"assistant\",\"session_id\":\"sess-2\",\"message\":{\"content\":[]}}\n",
            "\n",
            "{\"type\":\"assistant\",\"message\":{\"content\":[]}}\n",
            "{\"type\":\"result\",\"pr_number\":99,\"result\":\"done\"}\n",
        );

        let (tx, mut rx) = notify_channel();
        let summary = ingest_stdout(stream.as_bytes(), "a1", state.clone(), tx).await;
        assert_eq!(summary.session_id.as_deref(), Some("sess-1"));
        assert_eq!(summary.turns, 2);
        assert_eq!(summary.pr_number, Some(99));
        assert!(!summary.pr_via_fallback);
        assert!(!summary.saw_rate_limit);
        assert!(rx.try_recv().is_err());

        let events = state.list_events("a1", 0).await.unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].event_type, EventType::System);
        assert_eq!(events[3].event_type, EventType::Result);
    }

    #[tokio::test]
    async fn test_ingest_replayed_stream_preserves_content() {
        let temp = TempDir::new().unwrap();
        let state = spawn_state(&temp).await;

        let stream = "{\"type\":\"assistant\",\"message\":{\"content\":[]}}\n";
        ingest_stdout(stream.as_bytes(), "a1", state.clone(), notify_channel().0).await;
        ingest_stdout(stream.as_bytes(), "a1", state.clone(), notify_channel().0).await;

        // Replaying appends new rows with new ids; content is preserved
        let events = state.list_events("a1", 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_ne!(events[0].id, events[1].id);
        assert_eq!(events[0].event_data, events[1].event_data);
    }

    #[tokio::test]
    async fn test_ingest_flags_rate_limit_event() {
        let temp = TempDir::new().unwrap();
        let state = spawn_state(&temp).await;

        let stream = "{\"type\":\"rate_limit_event\",\"retry_after\":60}\n";
        let (tx, mut rx) = notify_channel();
        let summary = ingest_stdout(stream.as_bytes(), "a1", state.clone(), tx).await;
        assert!(summary.saw_rate_limit);
        // The supervisor was poked, same as a stderr signature hit
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_ingest_notifies_on_rate_limit_error_event() {
        let temp = TempDir::new().unwrap();
        let state = spawn_state(&temp).await;

        let stream = "{\"type\":\"error\",\"message\":\"API overloaded, retry later\"}\n";
        let (tx, mut rx) = notify_channel();
        let summary = ingest_stdout(stream.as_bytes(), "a1", state.clone(), tx).await;
        assert!(summary.saw_rate_limit);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_ingest_unparseable_line_becomes_error_event() {
        let temp = TempDir::new().unwrap();
        let state = spawn_state(&temp).await;

        let stream = "garbage output\n";
        ingest_stdout(stream.as_bytes(), "a1", state.clone(), notify_channel().0).await;

        let events = state.list_events("a1", 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].event_data, "garbage output");
    }

    #[tokio::test]
    async fn test_scan_stderr_counts_hits_and_notifies() {
        let temp = TempDir::new().unwrap();
        let state = spawn_state(&temp).await;

        let run = crate::domain::AgentRun::new_running("a1".to_string(), crate::domain::AgentKind::Implement);
        state.create_agent_run(run).await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let stderr = "starting up\nError: 429 Too Many Requests\nretrying\n";
        let hits = scan_stderr(stderr.as_bytes(), "a1", state.clone(), tx).await;

        assert_eq!(hits, 1);
        assert!(rx.try_recv().is_ok());

        let fetched = state.get_agent_run("a1").await.unwrap().unwrap();
        assert_eq!(fetched.rate_limit_hits, 1);
    }
}
