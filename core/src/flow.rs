//! Generic flow controller + event store (spec §4.M).
//!
//! Grounded on `alfredjeanlab-oddjobs`'s embedded-storage daemon pattern;
//! `rusqlite` (bundled) is the lighter-weight idiomatic choice here over a
//! full ORM for a single-writer, single-process event log of this size
//! (SPEC_FULL.md §6, `flows.sqlite3`).

use std::path::Path;
use std::sync::Arc;

use conductor_protocol::ConductorError;
use conductor_protocol::Result;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl FlowStatus {
    fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Running => "running",
            FlowStatus::Paused => "paused",
            FlowStatus::Stopped => "stopped",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "running" => Ok(FlowStatus::Running),
            "paused" => Ok(FlowStatus::Paused),
            "stopped" => Ok(FlowStatus::Stopped),
            "completed" => Ok(FlowStatus::Completed),
            "failed" => Ok(FlowStatus::Failed),
            other => Err(ConductorError::Fatal(format!("unknown flow status in store: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowRun {
    pub id: i64,
    pub flow_type: String,
    pub status: FlowStatus,
    pub current_step: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub error_message: Option<String>,
    pub state_json: String,
    pub input_json: String,
}

#[derive(Debug, Clone)]
pub struct FlowEvent {
    pub id: i64,
    pub run_id: i64,
    pub seq: i64,
    pub event_type: String,
    pub data_json: String,
    pub timestamp: String,
}

/// One flow controller per workspace database file. The inner connection is
/// guarded by a `Mutex` since `rusqlite::Connection` is `!Sync`.
pub struct FlowStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS flow_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flow_type TEXT NOT NULL,
    status TEXT NOT NULL,
    current_step TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    error_message TEXT,
    state_json TEXT NOT NULL,
    input_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS flow_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES flow_runs(id),
    seq INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    data_json TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    UNIQUE(run_id, seq)
);
";

impl FlowStore {
    pub fn open(db_path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(ConductorError::Io)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| ConductorError::Fatal(format!("failed to open flows database: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| ConductorError::Fatal(format!("failed to initialize flows schema: {e}")))?;
        Ok(Arc::new(FlowStore { conn: Mutex::new(conn) }))
    }

    /// Starts a new flow run, recording `flow_started` as its first event
    /// (spec §4.M ordering guarantee).
    pub async fn start_flow(&self, flow_type: &str, input_json: &str) -> Result<FlowRun> {
        let conn = self.conn.lock().await;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO flow_runs (flow_type, status, current_step, started_at, finished_at, error_message, state_json, input_json, created_at)
             VALUES (?1, ?2, NULL, ?3, NULL, NULL, '{}', ?4, ?3)",
            params![flow_type, FlowStatus::Running.as_str(), now, input_json],
        )
        .map_err(db_err)?;
        let id = conn.last_insert_rowid();
        append_event(&conn, id, "flow_started", "{}")?;
        load_run(&conn, id)
    }

    pub async fn get_run(&self, id: i64) -> Result<FlowRun> {
        let conn = self.conn.lock().await;
        load_run(&conn, id)
    }

    /// Sets the cancellation flag: transitions a running run to `stopped`.
    /// The in-progress step observes this at its next await point by
    /// re-checking `get_run().status`.
    pub async fn stop_flow(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE flow_runs SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![FlowStatus::Stopped.as_str(), id, FlowStatus::Running.as_str()],
        )
        .map_err(db_err)?;
        append_event(&conn, id, "flow_stopped", "{}")?;
        Ok(())
    }

    /// Resumes a paused or stopped run back to `running`. Errs on any other
    /// status (spec §4.M: "only if status ∈ {paused, stopped}").
    pub async fn resume_flow(&self, id: i64) -> Result<FlowRun> {
        let conn = self.conn.lock().await;
        let run = load_run(&conn, id)?;
        if !matches!(run.status, FlowStatus::Paused | FlowStatus::Stopped) {
            return Err(ConductorError::validation(format!(
                "flow {id} cannot resume from status {}",
                run.status.as_str()
            )));
        }
        conn.execute(
            "UPDATE flow_runs SET status = ?1 WHERE id = ?2",
            params![FlowStatus::Running.as_str(), id],
        )
        .map_err(db_err)?;
        load_run(&conn, id)
    }

    pub async fn record_step_started(&self, id: i64, step_name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE flow_runs SET current_step = ?1 WHERE id = ?2",
            params![step_name, id],
        )
        .map_err(db_err)?;
        append_event(&conn, id, "step_started", &format!("{{\"step\":\"{step_name}\"}}"))
    }

    pub async fn record_step_completed(&self, id: i64, state_json: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE flow_runs SET state_json = ?1 WHERE id = ?2", params![state_json, id])
            .map_err(db_err)?;
        append_event(&conn, id, "step_completed", "{}")
    }

    pub async fn record_step_failed(&self, id: i64, error_message: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        append_event(&conn, id, "step_failed", &json_escape_field("error", error_message))
    }

    pub async fn record_step_paused(&self, id: i64, reason: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE flow_runs SET status = ?1 WHERE id = ?2",
            params![FlowStatus::Paused.as_str(), id],
        )
        .map_err(db_err)?;
        append_event(&conn, id, "step_paused", &json_escape_field("reason", reason))
    }

    /// Terminal transition. `event_type` must be one of
    /// `flow_completed|flow_failed|flow_stopped` (spec §4.M ordering
    /// guarantee: always the last event of a run).
    pub async fn finish(&self, id: i64, status: FlowStatus, event_type: &str, detail: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = now_rfc3339();
        conn.execute(
            "UPDATE flow_runs SET status = ?1, finished_at = ?2, error_message = ?3 WHERE id = ?4",
            params![status.as_str(), now, if detail.is_empty() { None } else { Some(detail) }, id],
        )
        .map_err(db_err)?;
        append_event(&conn, id, event_type, "{}")
    }

    /// Returns events for `id` with `seq > after_seq`, in order.
    pub async fn stream_events(&self, id: i64, after_seq: Option<i64>) -> Result<Vec<FlowEvent>> {
        let conn = self.conn.lock().await;
        let after = after_seq.unwrap_or(0);
        let mut stmt = conn
            .prepare("SELECT id, run_id, seq, event_type, data_json, timestamp FROM flow_events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id, after], |row| {
                Ok(FlowEvent {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    seq: row.get(2)?,
                    event_type: row.get(3)?,
                    data_json: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })
            .map_err(db_err)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(db_err)?);
        }
        Ok(events)
    }
}

fn append_event(conn: &Connection, run_id: i64, event_type: &str, data_json: &str) -> Result<()> {
    let next_seq: i64 = conn
        .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM flow_events WHERE run_id = ?1", params![run_id], |row| row.get(0))
        .map_err(db_err)?;
    conn.execute(
        "INSERT INTO flow_events (run_id, seq, event_type, data_json, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![run_id, next_seq, event_type, data_json, now_rfc3339()],
    )
    .map_err(db_err)?;
    Ok(())
}

fn load_run(conn: &Connection, id: i64) -> Result<FlowRun> {
    let row = conn
        .query_row(
            "SELECT id, flow_type, status, current_step, started_at, finished_at, error_message, state_json, input_json FROM flow_runs WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| ConductorError::validation(format!("no flow run with id {id}")))?;
    Ok(FlowRun {
        id: row.0,
        flow_type: row.1,
        status: FlowStatus::parse(&row.2)?,
        current_step: row.3,
        started_at: row.4,
        finished_at: row.5,
        error_message: row.6,
        state_json: row.7,
        input_json: row.8,
    })
}

fn db_err(e: rusqlite::Error) -> ConductorError {
    ConductorError::Fatal(format!("flow store error: {e}"))
}

fn json_escape_field(key: &str, value: &str) -> String {
    serde_json::json!({ key: value }).to_string()
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn start_flow_emits_flow_started_first() {
        let dir = tempdir().expect("tempdir");
        let store = FlowStore::open(&dir.path().join("flows.sqlite3")).expect("open");
        let run = store.start_flow("ticket_flow", "{}").await.expect("start");
        let events = store.stream_events(run.id, None).await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "flow_started");
    }

    #[tokio::test]
    async fn stop_then_resume_round_trips_status() {
        let dir = tempdir().expect("tempdir");
        let store = FlowStore::open(&dir.path().join("flows.sqlite3")).expect("open");
        let run = store.start_flow("ticket_flow", "{}").await.expect("start");
        store.stop_flow(run.id).await.expect("stop");
        let stopped = store.get_run(run.id).await.expect("get");
        assert_eq!(stopped.status, FlowStatus::Stopped);

        let resumed = store.resume_flow(run.id).await.expect("resume");
        assert_eq!(resumed.status, FlowStatus::Running);
    }

    #[tokio::test]
    async fn resume_rejects_running_status() {
        let dir = tempdir().expect("tempdir");
        let store = FlowStore::open(&dir.path().join("flows.sqlite3")).expect("open");
        let run = store.start_flow("ticket_flow", "{}").await.expect("start");
        let result = store.resume_flow(run.id).await;
        assert!(result.is_err());
    }
}
