//! Run index + log layout (spec §4.J).
//!
//! Grounded on `codex-core::rollout::recorder`'s append-only JSONL-plus-index
//! pattern, adapted here to the spec's "shared log + per-run offsets" shape:
//! a single rotating `conductor.log` all runs append to, with a JSON index
//! recording each run's `[start_offset, end_offset)` slice into it.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use conductor_protocol::ConductorError;
use conductor_protocol::Result;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::lock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppServerMeta {
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsageMeta {
    pub delta: Option<serde_json::Value>,
    pub thread_total_before: Option<serde_json::Value>,
    pub thread_total_after: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub plan_path: Option<PathBuf>,
    pub diff_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TodoCounts {
    pub completed: u32,
    pub added: u32,
    pub reopened: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub start_offset: u64,
    pub end_offset: Option<u64>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
    pub run_log_path: PathBuf,
    pub app_server: AppServerMeta,
    pub token_usage: TokenUsageMeta,
    pub artifacts: ArtifactPaths,
    pub todo: TodoCounts,
    pub todo_snapshot_before: Option<String>,
    pub todo_snapshot_after: Option<String>,
}

/// `run_index.json`, keyed by stringified run id (spec §3 `RunIndexEntry`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunIndex {
    entries: BTreeMap<String, RunIndexEntry>,
}

impl RunIndex {
    pub fn get(&self, run_id: u64) -> Option<&RunIndexEntry> {
        self.entries.get(&run_id.to_string())
    }

    pub fn insert(&mut self, run_id: u64, entry: RunIndexEntry) {
        self.entries.insert(run_id.to_string(), entry);
    }
}

pub async fn load_index(path: &Path) -> Result<RunIndex> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(ConductorError::Json),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RunIndex::default()),
        Err(e) => Err(ConductorError::Io(e)),
    }
}

pub async fn save_index(path: &Path, index: &RunIndex) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(index).map_err(ConductorError::Json)?;
    lock::atomic_write(path, &bytes).await
}

fn run_start_marker(run_id: u64) -> String {
    format!("=== run {run_id} start ===\n")
}

fn run_end_marker(run_id: u64, exit_code: i32) -> String {
    format!("=== run {run_id} end (code {exit_code}) ===\n")
}

/// Appends a line to the shared global log, returning the byte offset it
/// was written at (for use as a run's `start_offset`/`end_offset`).
pub async fn append_shared_log(shared_log_path: &Path, line: &str) -> Result<u64> {
    if let Some(parent) = shared_log_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(ConductorError::Io)?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(shared_log_path)
        .await
        .map_err(ConductorError::Io)?;
    let offset = file.metadata().await.map_err(ConductorError::Io)?.len();
    file.write_all(line.as_bytes()).await.map_err(ConductorError::Io)?;
    file.flush().await.map_err(ConductorError::Io)?;
    Ok(offset)
}

/// Writes the `=== run <id> start ===` marker and returns the offset the
/// run's content begins at.
pub async fn start_run_block(shared_log_path: &Path, run_id: u64) -> Result<u64> {
    append_shared_log(shared_log_path, &run_start_marker(run_id)).await
}

/// Writes the `=== run <id> end (code <N>) ===` marker and updates the
/// matching run-index entry with `end_offset`/`finished_at`/`exit_code`.
pub async fn end_run_block(
    shared_log_path: &Path,
    index_path: &Path,
    run_id: u64,
    exit_code: i32,
    finished_at: &str,
) -> Result<()> {
    let marker = run_end_marker(run_id, exit_code);
    let end_offset = append_shared_log(shared_log_path, &marker).await? + marker.len() as u64;

    let _lock = lock::state_lock(index_path).await?;
    let mut index = load_index(index_path).await?;
    if let Some(entry) = index.entries.get_mut(&run_id.to_string()) {
        entry.end_offset = Some(end_offset);
        entry.finished_at = Some(finished_at.to_string());
        entry.exit_code = Some(exit_code);
    }
    save_index(index_path, &index).await
}

/// Returns the run's log content: the per-run file if present, else the
/// `[start_offset, end_offset)` slice of the shared log.
pub async fn read_run_block(shared_log_path: &Path, per_run_path: &Path, entry: &RunIndexEntry) -> Result<String> {
    if let Ok(contents) = tokio::fs::read_to_string(per_run_path).await {
        return Ok(contents);
    }
    let bytes = tokio::fs::read(shared_log_path).await.map_err(ConductorError::Io)?;
    let start = entry.start_offset as usize;
    let end = entry.end_offset.map(|e| e as usize).unwrap_or(bytes.len()).min(bytes.len());
    let start = start.min(end);
    Ok(String::from_utf8_lossy(&bytes[start..end]).into_owned())
}

/// Extracts the tail of the previous run's output, bounded by
/// `max_chars`, preferring content after a recognized "tokens used"
/// marker and stripping log-line prefixes (spec §4.J).
pub fn extract_prev_run_output(raw: &str, max_chars: usize) -> String {
    const TOKENS_MARKER: &str = "tokens used";
    let body = match raw.to_ascii_lowercase().rfind(TOKENS_MARKER) {
        Some(idx) => {
            let after = raw[idx..].find('\n').map(|n| idx + n + 1).unwrap_or(raw.len());
            &raw[after..]
        }
        None => raw,
    };
    let stripped: String = body
        .lines()
        .map(strip_log_prefix)
        .collect::<Vec<_>>()
        .join("\n");
    if stripped.chars().count() <= max_chars {
        stripped
    } else {
        let char_count = stripped.chars().count();
        stripped.chars().skip(char_count - max_chars).collect()
    }
}

/// Strips a leading `[timestamp] ` / `LEVEL ` log-line prefix if present.
fn strip_log_prefix(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix('[') {
        if let Some(end) = rest.find("] ") {
            return &rest[end + 2..];
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn start_and_end_markers_update_index_offsets() {
        let dir = tempdir().expect("tempdir");
        let shared_log = dir.path().join("conductor.log");
        let index_path = dir.path().join("run_index.json");

        let start_offset = start_run_block(&shared_log, 1).await.expect("start marker");
        let mut index = load_index(&index_path).await.expect("load");
        index.insert(
            1,
            RunIndexEntry {
                start_offset,
                end_offset: None,
                started_at: "2026-01-01T00:00:00Z".to_string(),
                finished_at: None,
                exit_code: None,
                log_path: shared_log.clone(),
                run_log_path: dir.path().join("run-1.log"),
                app_server: AppServerMeta::default(),
                token_usage: TokenUsageMeta::default(),
                artifacts: ArtifactPaths::default(),
                todo: TodoCounts::default(),
                todo_snapshot_before: None,
                todo_snapshot_after: None,
            },
        );
        save_index(&index_path, &index).await.expect("save");

        end_run_block(&shared_log, &index_path, 1, 0, "2026-01-01T00:01:00Z")
            .await
            .expect("end marker");

        let reloaded = load_index(&index_path).await.expect("reload");
        let entry = reloaded.get(1).expect("entry");
        assert!(entry.end_offset.unwrap() > entry.start_offset);
        assert_eq!(entry.exit_code, Some(0));
    }

    #[test]
    fn extract_prev_run_output_prefers_content_after_tokens_marker() {
        let raw = "[2026-01-01T00:00:00Z] starting\ntokens used: 120\n[2026-01-01T00:00:01Z] done with task\n";
        let extracted = extract_prev_run_output(raw, 1000);
        assert_eq!(extracted, "done with task");
    }
}
