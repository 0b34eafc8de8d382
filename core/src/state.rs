//! Durable per-workspace runner state (spec §4.B, §3 `RunnerState`).
//!
//! Grounded on `codex-core::rollout`'s JSON-file-as-durable-record pattern;
//! all reads/writes funnel through [`crate::lock::state_lock`] so a given
//! state path is never read and written by two tasks concurrently.

use std::collections::HashMap;
use std::path::Path;

use conductor_protocol::ApprovalPolicy;
use conductor_protocol::ConductorError;
use conductor_protocol::Result;
use conductor_protocol::SandboxPolicy;
use serde::Deserialize;
use serde::Serialize;

use crate::lock;
use crate::lock::StateLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Error,
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Idle
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerState {
    pub last_run_id: u64,
    pub status: RunStatus,
    pub last_exit_code: Option<i32>,
    pub last_run_started_at: Option<String>,
    pub last_run_finished_at: Option<String>,
    pub autorunner_agent_override: Option<String>,
    pub autorunner_model_override: Option<String>,
    pub autorunner_effort_override: Option<String>,
    #[serde(with = "approval_policy_opt")]
    pub autorunner_approval_policy: Option<ApprovalPolicy>,
    #[serde(with = "sandbox_policy_opt")]
    pub autorunner_sandbox_mode: Option<SandboxPolicy>,
    pub autorunner_workspace_write_network: bool,
    pub runner_pid: Option<u32>,
    /// feature key / ticket key -> opaque session descriptor.
    pub sessions: HashMap<String, String>,
    /// normalized `repo` or `repo:agent` -> session descriptor.
    pub repo_to_session: HashMap<String, String>,
}

mod approval_policy_opt {
    use conductor_protocol::ApprovalPolicy;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(v: &Option<ApprovalPolicy>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(p) => s.serialize_str(p.as_wire_str()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ApprovalPolicy>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.and_then(|s| match s.as_str() {
            "never" => Some(ApprovalPolicy::Never),
            "on-request" => Some(ApprovalPolicy::OnRequest),
            "on-failure" => Some(ApprovalPolicy::OnFailure),
            "always" => Some(ApprovalPolicy::Always),
            _ => None,
        }))
    }
}

mod sandbox_policy_opt {
    use conductor_protocol::SandboxPolicy;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(v: &Option<SandboxPolicy>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(p) => s.serialize_str(p.as_wire_str()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SandboxPolicy>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.and_then(|s| match s.as_str() {
            "readOnly" => Some(SandboxPolicy::ReadOnly),
            "workspaceWrite" => Some(SandboxPolicy::WorkspaceWrite),
            "dangerFullAccess" => Some(SandboxPolicy::DangerFullAccess),
            _ => None,
        }))
    }
}

/// Normalizes legacy `repo_to_session` keys: a bare `repo` stays as-is for
/// the default agent; any `repo|agent` or `repo/agent` spelling collapses to
/// the canonical `repo:agent` form.
fn normalize_repo_to_session(map: HashMap<String, String>) -> HashMap<String, String> {
    map.into_iter()
        .map(|(k, v)| {
            let normalized = if let Some((repo, agent)) = k.split_once(['|', ':']) {
                format!("{repo}:{agent}")
            } else {
                k
            };
            (normalized, v)
        })
        .collect()
}

/// Loads the state at `path`, defaulting to an idle, empty state if the file
/// does not exist. Caller is expected to hold the corresponding
/// [`StateLock`] for the duration of any read-modify-write sequence.
pub async fn load(path: &Path) -> Result<RunnerState> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let mut state: RunnerState = serde_json::from_slice(&bytes).map_err(ConductorError::Json)?;
            state.repo_to_session = normalize_repo_to_session(state.repo_to_session);
            Ok(state)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RunnerState::default()),
        Err(e) => Err(ConductorError::Io(e)),
    }
}

pub async fn save(path: &Path, state: &RunnerState) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(state).map_err(ConductorError::Json)?;
    lock::atomic_write(path, &bytes).await
}

pub async fn state_lock(path: &Path) -> Result<StateLock> {
    lock::state_lock(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_yields_idle_default() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let state = load(&path).await.expect("load");
        assert_eq!(state.status, RunStatus::Idle);
        assert_eq!(state.last_run_id, 0);
        assert!(state.sessions.is_empty());
    }

    #[tokio::test]
    async fn round_trips_through_save_and_load() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let _guard = state_lock(&path).await.expect("lock");
        let mut state = RunnerState::default();
        state.last_run_id = 4;
        state.status = RunStatus::Running;
        state.repo_to_session.insert("my-repo|opencode".to_string(), "sess-1".to_string());
        save(&path, &state).await.expect("save");
        drop(_guard);

        let reloaded = load(&path).await.expect("reload");
        assert_eq!(reloaded.last_run_id, 4);
        assert_eq!(reloaded.status, RunStatus::Running);
        assert_eq!(
            reloaded.repo_to_session.get("my-repo:opencode"),
            Some(&"sess-1".to_string())
        );
    }
}
