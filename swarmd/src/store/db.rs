//! SQLite-backed store
//!
//! One connection, owned by the StateManager actor. WAL mode gives readers
//! that never block the single writer. All transition updates are guarded by
//! a WHERE clause over the current status so concurrent handlers racing
//! through the actor cannot double-apply a transition.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{
    AgentEvent, AgentRun, AgentRunStatus, AgentKind, EventType, IterationStatus, ReviewIteration, WorkItem,
    WorkItemStatus,
};

use super::messages::StateError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS work_items (
    number            INTEGER PRIMARY KEY,
    title             TEXT NOT NULL,
    body              TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'pending',
    assigned_agent_id TEXT,
    pr_number         INTEGER,
    attempts          INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_runs (
    agent_id          TEXT PRIMARY KEY,
    work_item_number  INTEGER,
    pr_number         INTEGER,
    kind              TEXT NOT NULL,
    status            TEXT NOT NULL,
    worktree_path     TEXT,
    branch_name       TEXT,
    pid               INTEGER,
    session_id        TEXT,
    resume_count      INTEGER NOT NULL DEFAULT 0,
    rate_limited_at   TEXT,
    rate_limit_hits   INTEGER NOT NULL DEFAULT 0,
    started_at        TEXT NOT NULL,
    finished_at       TEXT,
    error_message     TEXT
);

CREATE TABLE IF NOT EXISTS agent_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id    TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    event_data  TEXT NOT NULL,
    timestamp   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_events_agent ON agent_events(agent_id, id);

CREATE TABLE IF NOT EXISTS review_iterations (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    pr_number      INTEGER NOT NULL,
    iteration      INTEGER NOT NULL,
    comments_count INTEGER NOT NULL DEFAULT 0,
    comments_json  TEXT,
    agent_id       TEXT,
    status         TEXT NOT NULL DEFAULT 'pending',
    created_at     TEXT NOT NULL,
    UNIQUE(pr_number, iteration)
);
";

/// Columns added after the initial schema shipped. Startup migration adds any
/// that are missing; re-running is a no-op.
const MIGRATIONS: &[(&str, &str, &str)] = &[
    ("work_items", "pr_number", "INTEGER"),
    ("work_items", "assigned_agent_id", "TEXT"),
    ("agent_runs", "session_id", "TEXT"),
    ("agent_runs", "resume_count", "INTEGER NOT NULL DEFAULT 0"),
    ("agent_runs", "rate_limited_at", "TEXT"),
    ("agent_runs", "rate_limit_hits", "INTEGER NOT NULL DEFAULT 0"),
    ("review_iterations", "comments_json", "TEXT"),
];

/// Columns selected for agent runs, with turns derived from the event log
const AGENT_RUN_SELECT: &str = "
SELECT agent_id, work_item_number, pr_number, kind, status, worktree_path, branch_name,
       pid, session_id, resume_count, rate_limited_at, rate_limit_hits,
       (SELECT COUNT(*) FROM agent_events e
         WHERE e.agent_id = agent_runs.agent_id AND e.event_type = 'assistant') AS turns_used,
       started_at, finished_at, error_message
  FROM agent_runs";

/// Aggregate counters for the dashboard and the status command
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreMetrics {
    pub pending: u32,
    pub in_progress: u32,
    pub pr_created: u32,
    pub resolved: u32,
    pub needs_human: u32,
    pub open_prs: u32,
    pub running_agents: u32,
    pub rate_limited_agents: u32,
    pub avg_turns: f64,
}

/// The SQLite store. Not Sync; lives inside the StateManager actor.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store and bring the schema up to date
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        let store = Self { conn };
        store.migrate()?;
        debug!(path = %path.display(), "opened state store");
        Ok(store)
    }

    /// Add any missing columns. Detection precedes the alter, so running this
    /// N times is equivalent to running it once.
    fn migrate(&self) -> Result<(), StateError> {
        for (table, column, decl) in MIGRATIONS {
            let existing = self.table_columns(table)?;
            if !existing.contains(*column) {
                info!(table, column, "migrating: adding missing column");
                self.conn
                    .execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])?;
            }
        }
        Ok(())
    }

    fn table_columns(&self, table: &str) -> Result<HashSet<String>, StateError> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(names)
    }

    // === Work items ===

    /// Insert if absent with status=pending; otherwise touch updated_at only
    pub fn upsert_work_item(&self, number: i64, title: &str, body: &str) -> Result<WorkItem, StateError> {
        let now = now_sql();
        self.conn.execute(
            "INSERT INTO work_items (number, title, body, status, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)
             ON CONFLICT(number) DO UPDATE SET updated_at = excluded.updated_at",
            params![number, title, body, now],
        )?;
        self.get_work_item(number)?
            .ok_or_else(|| StateError::NotFound(format!("work item #{number}")))
    }

    /// Upsert and jump straight to pr_created (existing-PR detection path)
    pub fn seed_pr_created(&self, number: i64, title: &str, body: &str, pr_number: i64) -> Result<WorkItem, StateError> {
        self.upsert_work_item(number, title, body)?;
        self.conn.execute(
            "UPDATE work_items SET status = 'pr_created', pr_number = ?1, updated_at = ?2
             WHERE number = ?3 AND status = 'pending'",
            params![pr_number, now_sql(), number],
        )?;
        self.get_work_item(number)?
            .ok_or_else(|| StateError::NotFound(format!("work item #{number}")))
    }

    /// Atomic pending -> in_progress claim; increments attempts.
    /// Returns false when the item was not claimable (already taken or gone).
    pub fn claim_work_item(&self, number: i64, agent_id: &str) -> Result<bool, StateError> {
        let changed = self.conn.execute(
            "UPDATE work_items
                SET status = 'in_progress', assigned_agent_id = ?1,
                    attempts = attempts + 1, updated_at = ?2
              WHERE number = ?3 AND status = 'pending'",
            params![agent_id, now_sql(), number],
        )?;
        Ok(changed == 1)
    }

    pub fn record_pr_created(&self, number: i64, pr_number: i64) -> Result<(), StateError> {
        let changed = self.conn.execute(
            "UPDATE work_items SET status = 'pr_created', pr_number = ?1, updated_at = ?2
              WHERE number = ?3 AND status = 'in_progress'",
            params![pr_number, now_sql(), number],
        )?;
        if changed == 0 {
            warn!(number, pr_number, "record_pr_created: work item not in_progress, skipped");
        }
        Ok(())
    }

    pub fn record_resolved(&self, number: i64) -> Result<(), StateError> {
        let changed = self.conn.execute(
            "UPDATE work_items SET status = 'resolved', updated_at = ?1
              WHERE number = ?2 AND status = 'pr_created'",
            params![now_sql(), number],
        )?;
        if changed == 0 {
            warn!(number, "record_resolved: work item not in pr_created, skipped");
        }
        Ok(())
    }

    pub fn record_needs_human(&self, number: i64) -> Result<(), StateError> {
        self.conn.execute(
            "UPDATE work_items SET status = 'needs_human', updated_at = ?1
              WHERE number = ?2 AND status NOT IN ('resolved', 'needs_human')",
            params![now_sql(), number],
        )?;
        Ok(())
    }

    /// Re-queue after a failed attempt or orphan recovery. Only items still
    /// in_progress with no PR go back to pending.
    pub fn reset_to_pending(&self, number: i64) -> Result<(), StateError> {
        self.conn.execute(
            "UPDATE work_items SET status = 'pending', assigned_agent_id = NULL, updated_at = ?1
              WHERE number = ?2 AND status = 'in_progress' AND pr_number IS NULL",
            params![now_sql(), number],
        )?;
        Ok(())
    }

    /// Un-count a dispatch whose run was rate-limited. The claim counted the
    /// dispatch optimistically; a suspended run has not concluded, so the
    /// attempt must not show while the run sits in rate_limited.
    pub fn uncount_attempt(&self, number: i64) -> Result<(), StateError> {
        self.conn.execute(
            "UPDATE work_items SET attempts = MAX(attempts - 1, 0), updated_at = ?1 WHERE number = ?2",
            params![now_sql(), number],
        )?;
        Ok(())
    }

    /// Re-count the dispatch when a rate-limited run is resumed
    pub fn recount_attempt(&self, number: i64) -> Result<(), StateError> {
        self.conn.execute(
            "UPDATE work_items SET attempts = attempts + 1, updated_at = ?1 WHERE number = ?2",
            params![now_sql(), number],
        )?;
        Ok(())
    }

    pub fn get_work_item(&self, number: i64) -> Result<Option<WorkItem>, StateError> {
        let item = self
            .conn
            .query_row(
                "SELECT number, title, body, status, assigned_agent_id, pr_number, attempts,
                        created_at, updated_at
                   FROM work_items WHERE number = ?1",
                params![number],
                work_item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    pub fn list_work_items(&self, status: Option<WorkItemStatus>) -> Result<Vec<WorkItem>, StateError> {
        let base = "SELECT number, title, body, status, assigned_agent_id, pr_number, attempts,
                           created_at, updated_at
                      FROM work_items";
        let items = match status {
            Some(s) => {
                let mut stmt = self.conn.prepare(&format!("{base} WHERE status = ?1 ORDER BY number"))?;
                stmt.query_map(params![s.as_str()], work_item_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{base} ORDER BY number"))?;
                stmt.query_map([], work_item_from_row)?.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(items)
    }

    // === Agent runs ===

    pub fn create_agent_run(&self, run: &AgentRun) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO agent_runs
                (agent_id, work_item_number, pr_number, kind, status, worktree_path, branch_name,
                 pid, session_id, resume_count, rate_limited_at, rate_limit_hits,
                 started_at, finished_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                run.agent_id,
                run.work_item_number,
                run.pr_number,
                run.kind.as_str(),
                run.status.as_str(),
                run.worktree_path,
                run.branch_name,
                run.pid,
                run.session_id,
                run.resume_count,
                run.rate_limited_at.map(|t| t.to_rfc3339()),
                run.rate_limit_hits,
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
                run.error_message,
            ],
        )?;
        Ok(())
    }

    /// Guarded status transition. Terminal statuses stamp finished_at and only
    /// apply to active runs; `resumed` only applies to rate-limited runs.
    /// Returns whether the transition took effect.
    pub fn record_agent_status(
        &self,
        agent_id: &str,
        status: AgentRunStatus,
        error: Option<&str>,
    ) -> Result<bool, StateError> {
        let guard = match status {
            AgentRunStatus::Resumed => "status = 'rate_limited'",
            AgentRunStatus::Running => "status IN ('running', 'rate_limited')",
            _ => "status IN ('running', 'rate_limited')",
        };
        let finished = match status {
            AgentRunStatus::Running => None,
            _ => Some(now_sql()),
        };
        let changed = self.conn.execute(
            &format!(
                "UPDATE agent_runs
                    SET status = ?1, error_message = COALESCE(?2, error_message),
                        finished_at = COALESCE(?3, finished_at),
                        pid = CASE WHEN ?1 IN ('running', 'rate_limited') THEN pid ELSE NULL END
                  WHERE agent_id = ?4 AND {guard}"
            ),
            params![status.as_str(), error, finished, agent_id],
        )?;
        if changed == 0 {
            debug!(agent_id, status = %status, "record_agent_status: guard rejected transition");
        }
        Ok(changed == 1)
    }

    /// First discovered session id wins; later writes are no-ops
    pub fn record_agent_session(&self, agent_id: &str, session_id: &str) -> Result<(), StateError> {
        self.conn.execute(
            "UPDATE agent_runs SET session_id = ?1 WHERE agent_id = ?2 AND session_id IS NULL",
            params![session_id, agent_id],
        )?;
        Ok(())
    }

    pub fn record_agent_pid(&self, agent_id: &str, pid: u32) -> Result<(), StateError> {
        self.conn.execute(
            "UPDATE agent_runs SET pid = ?1 WHERE agent_id = ?2",
            params![pid, agent_id],
        )?;
        Ok(())
    }

    /// running -> rate_limited, stamping rate_limited_at
    pub fn record_rate_limited(&self, agent_id: &str) -> Result<bool, StateError> {
        let changed = self.conn.execute(
            "UPDATE agent_runs SET status = 'rate_limited', rate_limited_at = ?1
              WHERE agent_id = ?2 AND status = 'running'",
            params![now_sql(), agent_id],
        )?;
        Ok(changed == 1)
    }

    pub fn increment_rate_limit_hits(&self, agent_id: &str) -> Result<(), StateError> {
        self.conn.execute(
            "UPDATE agent_runs SET rate_limit_hits = rate_limit_hits + 1 WHERE agent_id = ?1",
            params![agent_id],
        )?;
        Ok(())
    }

    pub fn get_agent_run(&self, agent_id: &str) -> Result<Option<AgentRun>, StateError> {
        let run = self
            .conn
            .query_row(
                &format!("{AGENT_RUN_SELECT} WHERE agent_id = ?1"),
                params![agent_id],
                agent_run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn list_agent_runs(&self, status: Option<AgentRunStatus>) -> Result<Vec<AgentRun>, StateError> {
        let runs = match status {
            Some(s) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{AGENT_RUN_SELECT} WHERE status = ?1 ORDER BY started_at"))?;
                stmt.query_map(params![s.as_str()], agent_run_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{AGENT_RUN_SELECT} ORDER BY started_at"))?;
                stmt.query_map([], agent_run_from_row)?.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(runs)
    }

    pub fn list_active_runs(&self) -> Result<Vec<AgentRun>, StateError> {
        let mut stmt = self.conn.prepare(&format!(
            "{AGENT_RUN_SELECT} WHERE status IN ('running', 'rate_limited') ORDER BY started_at"
        ))?;
        let runs = stmt.query_map([], agent_run_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn list_rate_limited_runs(&self) -> Result<Vec<AgentRun>, StateError> {
        let mut stmt = self.conn.prepare(&format!(
            "{AGENT_RUN_SELECT} WHERE status = 'rate_limited' ORDER BY rate_limited_at"
        ))?;
        let runs = stmt.query_map([], agent_run_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Rate-limited runs do not count toward the concurrency cap
    pub fn count_running(&self) -> Result<u32, StateError> {
        let count: u32 = self
            .conn
            .query_row("SELECT COUNT(*) FROM agent_runs WHERE status = 'running'", [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    pub fn active_run_for_work_item(&self, number: i64) -> Result<Option<AgentRun>, StateError> {
        let run = self
            .conn
            .query_row(
                &format!(
                    "{AGENT_RUN_SELECT}
                      WHERE work_item_number = ?1 AND status IN ('running', 'rate_limited')"
                ),
                params![number],
                agent_run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn active_run_for_pr(&self, pr_number: i64) -> Result<Option<AgentRun>, StateError> {
        let run = self
            .conn
            .query_row(
                &format!(
                    "{AGENT_RUN_SELECT}
                      WHERE pr_number = ?1 AND status IN ('running', 'rate_limited')"
                ),
                params![pr_number],
                agent_run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    // === Events (append-only) ===

    pub fn append_event(&self, agent_id: &str, event_type: EventType, data: &str) -> Result<i64, StateError> {
        self.conn.execute(
            "INSERT INTO agent_events (agent_id, event_type, event_data, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![agent_id, event_type.as_str(), data, now_sql()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_events(&self, agent_id: &str, since: i64) -> Result<Vec<AgentEvent>, StateError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, event_type, event_data, timestamp
               FROM agent_events WHERE agent_id = ?1 AND id > ?2 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![agent_id, since], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // === Review iterations ===

    /// Insert or refresh the snapshot for (pr, iteration); returns the row id
    pub fn upsert_review_iteration(
        &self,
        pr_number: i64,
        iteration: u32,
        comments_count: u32,
        comments_json: Option<&str>,
    ) -> Result<i64, StateError> {
        self.conn.execute(
            "INSERT INTO review_iterations (pr_number, iteration, comments_count, comments_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
             ON CONFLICT(pr_number, iteration) DO UPDATE SET
                 comments_count = excluded.comments_count,
                 comments_json = COALESCE(excluded.comments_json, review_iterations.comments_json)",
            params![pr_number, iteration, comments_count, comments_json, now_sql()],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM review_iterations WHERE pr_number = ?1 AND iteration = ?2",
            params![pr_number, iteration],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn link_fix_agent(&self, iteration_id: i64, agent_id: &str) -> Result<(), StateError> {
        self.conn.execute(
            "UPDATE review_iterations SET agent_id = ?1, status = 'fixing' WHERE id = ?2",
            params![agent_id, iteration_id],
        )?;
        Ok(())
    }

    pub fn record_iteration_status(&self, iteration_id: i64, status: IterationStatus) -> Result<(), StateError> {
        self.conn.execute(
            "UPDATE review_iterations SET status = ?1 WHERE id = ?2",
            params![status.as_str(), iteration_id],
        )?;
        Ok(())
    }

    pub fn list_iterations(&self, pr_number: Option<i64>) -> Result<Vec<ReviewIteration>, StateError> {
        let base = "SELECT id, pr_number, iteration, comments_count, comments_json, agent_id, status, created_at
                      FROM review_iterations";
        let iterations = match pr_number {
            Some(pr) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{base} WHERE pr_number = ?1 ORDER BY iteration"))?;
                stmt.query_map(params![pr], iteration_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{base} ORDER BY pr_number, iteration"))?;
                stmt.query_map([], iteration_from_row)?.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(iterations)
    }

    pub fn count_iterations(&self, pr_number: i64) -> Result<u32, StateError> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM review_iterations WHERE pr_number = ?1",
            params![pr_number],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn latest_iteration(&self, pr_number: i64) -> Result<Option<ReviewIteration>, StateError> {
        let iteration = self
            .conn
            .query_row(
                "SELECT id, pr_number, iteration, comments_count, comments_json, agent_id, status, created_at
                   FROM review_iterations WHERE pr_number = ?1 ORDER BY iteration DESC LIMIT 1",
                params![pr_number],
                iteration_from_row,
            )
            .optional()?;
        Ok(iteration)
    }

    // === Aggregates ===

    pub fn metrics(&self) -> Result<StoreMetrics, StateError> {
        let mut metrics = StoreMetrics::default();

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM work_items GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            match WorkItemStatus::parse(&status) {
                Some(WorkItemStatus::Pending) => metrics.pending = count,
                Some(WorkItemStatus::InProgress) => metrics.in_progress = count,
                Some(WorkItemStatus::PrCreated) => metrics.pr_created = count,
                Some(WorkItemStatus::Resolved) => metrics.resolved = count,
                Some(WorkItemStatus::NeedsHuman) => metrics.needs_human = count,
                None => warn!(%status, "metrics: unrecognized work item status in store"),
            }
        }

        metrics.open_prs = metrics.pr_created;
        metrics.running_agents = self.count_running()?;
        metrics.rate_limited_agents = self.conn.query_row(
            "SELECT COUNT(*) FROM agent_runs WHERE status = 'rate_limited'",
            [],
            |row| row.get(0),
        )?;
        metrics.avg_turns = self
            .conn
            .query_row(
                "SELECT COALESCE(AVG(turns), 0.0) FROM (
                     SELECT COUNT(*) AS turns
                       FROM agent_events e
                       JOIN agent_runs r ON r.agent_id = e.agent_id
                      WHERE r.status = 'completed' AND e.event_type = 'assistant'
                      GROUP BY e.agent_id)",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0.0);

        Ok(metrics)
    }
}

fn now_sql() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_ts_opt(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(idx, r)).transpose()
}

fn bad_enum(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::other(format!("unrecognized {what}: '{raw}'"))),
    )
}

fn work_item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItem> {
    let status_raw: String = row.get(3)?;
    let status = WorkItemStatus::parse(&status_raw).ok_or_else(|| bad_enum(3, "work item status", &status_raw))?;
    Ok(WorkItem {
        number: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        status,
        assigned_agent_id: row.get(4)?,
        pr_number: row.get(5)?,
        attempts: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
        updated_at: parse_ts(8, row.get(8)?)?,
    })
}

fn agent_run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRun> {
    let kind_raw: String = row.get(3)?;
    let kind = AgentKind::parse(&kind_raw).ok_or_else(|| bad_enum(3, "agent kind", &kind_raw))?;
    let status_raw: String = row.get(4)?;
    let status = AgentRunStatus::parse(&status_raw).ok_or_else(|| bad_enum(4, "agent run status", &status_raw))?;
    Ok(AgentRun {
        agent_id: row.get(0)?,
        work_item_number: row.get(1)?,
        pr_number: row.get(2)?,
        kind,
        status,
        worktree_path: row.get(5)?,
        branch_name: row.get(6)?,
        pid: row.get(7)?,
        session_id: row.get(8)?,
        resume_count: row.get(9)?,
        rate_limited_at: parse_ts_opt(10, row.get(10)?)?,
        rate_limit_hits: row.get(11)?,
        turns_used: row.get(12)?,
        started_at: parse_ts(13, row.get(13)?)?,
        finished_at: parse_ts_opt(14, row.get(14)?)?,
        error_message: row.get(15)?,
    })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentEvent> {
    let ty_raw: String = row.get(2)?;
    let event_type = EventType::parse(&ty_raw).ok_or_else(|| bad_enum(2, "event type", &ty_raw))?;
    Ok(AgentEvent {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        event_type,
        event_data: row.get(3)?,
        timestamp: parse_ts(4, row.get(4)?)?,
    })
}

fn iteration_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewIteration> {
    let status_raw: String = row.get(6)?;
    let status = IterationStatus::parse(&status_raw).ok_or_else(|| bad_enum(6, "iteration status", &status_raw))?;
    Ok(ReviewIteration {
        id: row.get(0)?,
        pr_number: row.get(1)?,
        iteration: row.get(2)?,
        comments_count: row.get(3)?,
        comments_json: row.get(4)?,
        agent_id: row.get(5)?,
        status,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("swarm.db")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (_temp, store) = open_store();

        let first = store.upsert_work_item(42, "Add widget", "body").unwrap();
        assert_eq!(first.status, WorkItemStatus::Pending);
        assert_eq!(first.attempts, 0);

        let second = store.upsert_work_item(42, "Add widget", "body").unwrap();
        assert_eq!(second.number, 42);
        assert_eq!(second.status, WorkItemStatus::Pending);

        assert_eq!(store.list_work_items(None).unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_never_resets_non_pending_status() {
        let (_temp, store) = open_store();

        store.upsert_work_item(42, "t", "b").unwrap();
        assert!(store.claim_work_item(42, "agent-issue-42-attempt-1").unwrap());

        let item = store.upsert_work_item(42, "t", "b").unwrap();
        assert_eq!(item.status, WorkItemStatus::InProgress);
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn test_claim_is_atomic() {
        let (_temp, store) = open_store();
        store.upsert_work_item(7, "t", "b").unwrap();

        assert!(store.claim_work_item(7, "a1").unwrap());
        // Second claim must lose: the item is no longer pending
        assert!(!store.claim_work_item(7, "a2").unwrap());

        let item = store.get_work_item(7).unwrap().unwrap();
        assert_eq!(item.assigned_agent_id.as_deref(), Some("a1"));
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn test_work_item_lifecycle() {
        let (_temp, store) = open_store();
        store.upsert_work_item(42, "t", "b").unwrap();
        store.claim_work_item(42, "a1").unwrap();
        store.record_pr_created(42, 99).unwrap();

        let item = store.get_work_item(42).unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::PrCreated);
        assert_eq!(item.pr_number, Some(99));

        store.record_resolved(42).unwrap();
        let item = store.get_work_item(42).unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Resolved);
    }

    #[test]
    fn test_resolved_requires_pr_created() {
        let (_temp, store) = open_store();
        store.upsert_work_item(42, "t", "b").unwrap();

        store.record_resolved(42).unwrap();
        let item = store.get_work_item(42).unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Pending);
    }

    #[test]
    fn test_reset_to_pending_only_without_pr() {
        let (_temp, store) = open_store();
        store.upsert_work_item(1, "t", "b").unwrap();
        store.claim_work_item(1, "a1").unwrap();
        store.reset_to_pending(1).unwrap();
        assert_eq!(store.get_work_item(1).unwrap().unwrap().status, WorkItemStatus::Pending);

        store.upsert_work_item(2, "t", "b").unwrap();
        store.claim_work_item(2, "a2").unwrap();
        store.record_pr_created(2, 50).unwrap();
        store.reset_to_pending(2).unwrap();
        assert_eq!(
            store.get_work_item(2).unwrap().unwrap().status,
            WorkItemStatus::PrCreated
        );
    }

    #[test]
    fn test_attempt_counting_around_rate_limit() {
        let (_temp, store) = open_store();
        store.upsert_work_item(5, "t", "b").unwrap();
        store.claim_work_item(5, "a1").unwrap();
        assert_eq!(store.get_work_item(5).unwrap().unwrap().attempts, 1);

        // Rate limit suspends the dispatch; the attempt must not show
        store.uncount_attempt(5).unwrap();
        assert_eq!(store.get_work_item(5).unwrap().unwrap().attempts, 0);

        // Resume re-counts it
        store.recount_attempt(5).unwrap();
        assert_eq!(store.get_work_item(5).unwrap().unwrap().attempts, 1);

        // uncount never goes negative
        store.uncount_attempt(5).unwrap();
        store.uncount_attempt(5).unwrap();
        assert_eq!(store.get_work_item(5).unwrap().unwrap().attempts, 0);
    }

    #[test]
    fn test_seed_pr_created() {
        let (_temp, store) = open_store();
        let item = store.seed_pr_created(10, "t", "b", 77).unwrap();
        assert_eq!(item.status, WorkItemStatus::PrCreated);
        assert_eq!(item.pr_number, Some(77));
        assert_eq!(item.attempts, 0);

        // Seeding again does not disturb anything
        let item = store.seed_pr_created(10, "t", "b", 77).unwrap();
        assert_eq!(item.status, WorkItemStatus::PrCreated);
    }

    #[test]
    fn test_migration_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("swarm.db");

        let store = Store::open(&path).unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
        drop(store);

        // Reopening runs the migration again on the same file
        let store = Store::open(&path).unwrap();
        store.upsert_work_item(1, "t", "b").unwrap();
        assert_eq!(store.list_work_items(None).unwrap().len(), 1);
    }

    #[test]
    fn test_migration_adds_missing_column() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("swarm.db");

        // Simulate a pre-migration schema without rate_limit_hits
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE agent_runs (
                     agent_id TEXT PRIMARY KEY,
                     work_item_number INTEGER, pr_number INTEGER,
                     kind TEXT NOT NULL, status TEXT NOT NULL,
                     worktree_path TEXT, branch_name TEXT, pid INTEGER,
                     started_at TEXT NOT NULL, finished_at TEXT, error_message TEXT)",
            )
            .unwrap();
        }

        let store = Store::open(&path).unwrap();
        let columns = store.table_columns("agent_runs").unwrap();
        assert!(columns.contains("rate_limit_hits"));
        assert!(columns.contains("session_id"));
        assert!(columns.contains("resume_count"));
    }

    #[test]
    fn test_agent_run_crud_and_guards() {
        let (_temp, store) = open_store();
        let mut run = AgentRun::new_running("agent-issue-1-attempt-1".to_string(), AgentKind::Implement);
        run.work_item_number = Some(1);
        store.create_agent_run(&run).unwrap();

        store.record_agent_pid("agent-issue-1-attempt-1", 4242).unwrap();
        let fetched = store.get_agent_run("agent-issue-1-attempt-1").unwrap().unwrap();
        assert_eq!(fetched.pid, Some(4242));
        assert_eq!(fetched.status, AgentRunStatus::Running);

        // Terminal transition clears the pid and stamps finished_at
        assert!(
            store
                .record_agent_status("agent-issue-1-attempt-1", AgentRunStatus::Completed, None)
                .unwrap()
        );
        let fetched = store.get_agent_run("agent-issue-1-attempt-1").unwrap().unwrap();
        assert_eq!(fetched.status, AgentRunStatus::Completed);
        assert_eq!(fetched.pid, None);
        assert!(fetched.finished_at.is_some());

        // A second terminal transition is rejected by the guard
        assert!(
            !store
                .record_agent_status("agent-issue-1-attempt-1", AgentRunStatus::Failed, Some("late"))
                .unwrap()
        );
    }

    #[test]
    fn test_resumed_only_from_rate_limited() {
        let (_temp, store) = open_store();
        let run = AgentRun::new_running("a1".to_string(), AgentKind::Implement);
        store.create_agent_run(&run).unwrap();

        assert!(!store.record_agent_status("a1", AgentRunStatus::Resumed, None).unwrap());

        assert!(store.record_rate_limited("a1").unwrap());
        let fetched = store.get_agent_run("a1").unwrap().unwrap();
        assert!(fetched.rate_limited_at.is_some());

        assert!(store.record_agent_status("a1", AgentRunStatus::Resumed, None).unwrap());
    }

    #[test]
    fn test_rate_limited_releases_capacity_slot() {
        let (_temp, store) = open_store();
        for id in ["a1", "a2"] {
            let run = AgentRun::new_running(id.to_string(), AgentKind::Implement);
            store.create_agent_run(&run).unwrap();
        }
        assert_eq!(store.count_running().unwrap(), 2);

        store.record_rate_limited("a1").unwrap();
        assert_eq!(store.count_running().unwrap(), 1);
        assert_eq!(store.list_active_runs().unwrap().len(), 2);
        assert_eq!(store.list_rate_limited_runs().unwrap().len(), 1);
    }

    #[test]
    fn test_session_first_occurrence_wins() {
        let (_temp, store) = open_store();
        let run = AgentRun::new_running("a1".to_string(), AgentKind::Implement);
        store.create_agent_run(&run).unwrap();

        store.record_agent_session("a1", "sess-1").unwrap();
        store.record_agent_session("a1", "sess-2").unwrap();

        let fetched = store.get_agent_run("a1").unwrap().unwrap();
        assert_eq!(fetched.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn test_events_append_only_and_ordered() {
        let (_temp, store) = open_store();
        let first = store.append_event("a1", EventType::System, "{}").unwrap();
        let second = store.append_event("a1", EventType::Assistant, "{}").unwrap();
        assert!(second > first);

        let events = store.list_events("a1", 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::System);

        let newer = store.list_events("a1", first).unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, second);
    }

    #[test]
    fn test_turns_used_counts_assistant_events() {
        let (_temp, store) = open_store();
        let run = AgentRun::new_running("a1".to_string(), AgentKind::Implement);
        store.create_agent_run(&run).unwrap();

        store.append_event("a1", EventType::System, "{}").unwrap();
        store.append_event("a1", EventType::Assistant, "{}").unwrap();
        store.append_event("a1", EventType::Assistant, "{}").unwrap();
        store.append_event("a1", EventType::Result, "{}").unwrap();

        let fetched = store.get_agent_run("a1").unwrap().unwrap();
        assert_eq!(fetched.turns_used, 2);
    }

    #[test]
    fn test_review_iterations_dense_and_unique() {
        let (_temp, store) = open_store();
        let id1 = store.upsert_review_iteration(99, 1, 3, Some("[]")).unwrap();
        let id2 = store.upsert_review_iteration(99, 2, 1, None).unwrap();
        assert_ne!(id1, id2);

        // Upserting the same iteration refreshes rather than duplicating
        let id1b = store.upsert_review_iteration(99, 1, 5, None).unwrap();
        assert_eq!(id1, id1b);

        let iterations = store.list_iterations(Some(99)).unwrap();
        assert_eq!(iterations.len(), 2);
        assert_eq!(iterations[0].iteration, 1);
        assert_eq!(iterations[0].comments_count, 5);
        // COALESCE keeps the earlier snapshot when the refresh has none
        assert_eq!(iterations[0].comments_json.as_deref(), Some("[]"));

        assert_eq!(store.count_iterations(99).unwrap(), 2);
        assert_eq!(store.latest_iteration(99).unwrap().unwrap().iteration, 2);
    }

    #[test]
    fn test_iteration_fix_agent_link() {
        let (_temp, store) = open_store();
        let id = store.upsert_review_iteration(99, 1, 2, None).unwrap();
        store.link_fix_agent(id, "agent-fix-99-iter-1").unwrap();

        let iteration = store.latest_iteration(99).unwrap().unwrap();
        assert_eq!(iteration.status, IterationStatus::Fixing);
        assert_eq!(iteration.agent_id.as_deref(), Some("agent-fix-99-iter-1"));

        store.record_iteration_status(id, IterationStatus::Fixed).unwrap();
        let iteration = store.latest_iteration(99).unwrap().unwrap();
        assert_eq!(iteration.status, IterationStatus::Fixed);
    }

    #[test]
    fn test_metrics() {
        let (_temp, store) = open_store();
        store.upsert_work_item(1, "t", "b").unwrap();
        store.upsert_work_item(2, "t", "b").unwrap();
        store.claim_work_item(2, "a1").unwrap();
        store.upsert_work_item(3, "t", "b").unwrap();
        store.claim_work_item(3, "a2").unwrap();
        store.record_pr_created(3, 30).unwrap();

        let run = AgentRun::new_running("a1".to_string(), AgentKind::Implement);
        store.create_agent_run(&run).unwrap();

        let metrics = store.metrics().unwrap();
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.in_progress, 1);
        assert_eq!(metrics.pr_created, 1);
        assert_eq!(metrics.open_prs, 1);
        assert_eq!(metrics.running_agents, 1);
        assert_eq!(metrics.rate_limited_agents, 0);
    }

    #[test]
    fn test_avg_turns_over_completed_runs() {
        let (_temp, store) = open_store();
        for (id, turns) in [("a1", 4), ("a2", 2)] {
            let run = AgentRun::new_running(id.to_string(), AgentKind::Implement);
            store.create_agent_run(&run).unwrap();
            for _ in 0..turns {
                store.append_event(id, EventType::Assistant, "{}").unwrap();
            }
            store.record_agent_status(id, AgentRunStatus::Completed, None).unwrap();
        }

        let metrics = store.metrics().unwrap();
        assert!((metrics.avg_turns - 3.0).abs() < f64::EPSILON);
    }
}
