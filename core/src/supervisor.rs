//! Workspace-scoped agent process supervisor (spec §4.E).
//!
//! One [`WorkspaceSupervisor`] per agent kind, grounded on
//! `codex-core::conversation_manager::ConversationManager`'s
//! id-keyed-handle-map shape, generalized here to own subprocess lifecycle
//! (start/health-check/evict/restart) rather than just conversation state.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use conductor_agent_client::app_server::AppServerClient;
use conductor_agent_client::opencode::OpenCodeClient;
use conductor_agent_client::AgentClient;
use conductor_agent_client::ApprovalHandler;
use conductor_agent_client::NotificationHandler;
use conductor_protocol::ConductorError;
use conductor_protocol::Result;
use conductor_protocol::WorkspaceId;
use rand::Rng;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::warn;

/// One live (or starting) agent process/endpoint for a workspace.
struct Handle {
    client: Arc<dyn AgentClient>,
    child: Option<Child>,
    last_used_at: Instant,
    active_turns: u32,
    consecutive_restarts: u32,
}

/// Config the supervisor needs to start a fresh process; owned by the
/// caller (CLI / `WorkspaceContext`) and handed in at construction.
#[derive(Clone)]
pub struct AgentStartSpec {
    pub program: String,
    pub args: Vec<String>,
    pub request_timeout: Duration,
    /// `codex_home` seeding is only meaningful for the app-server variant.
    pub codex_home_base: Option<PathBuf>,
}

pub enum AgentVariant {
    AppServer {
        spec: AgentStartSpec,
        notification_handler: Arc<dyn NotificationHandler>,
        approval_handler: Arc<dyn ApprovalHandler>,
    },
    OpenCode {
        spec: AgentStartSpec,
    },
}

pub struct WorkspaceSupervisor {
    variant: AgentVariant,
    max_handles: usize,
    idle_ttl: Duration,
    handles: Mutex<HashMap<WorkspaceId, Handle>>,
    /// Per-workspace startup locks, independent of whether a `Handle`
    /// currently exists, so two concurrent `get_client` calls for the same
    /// workspace never spawn two processes.
    start_locks: Mutex<HashMap<WorkspaceId, Arc<Mutex<()>>>>,
}

const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const EVICT_GRACE: Duration = Duration::from_secs(5);

impl WorkspaceSupervisor {
    pub fn new(variant: AgentVariant, max_handles: usize, idle_ttl: Duration) -> Arc<Self> {
        Arc::new(WorkspaceSupervisor {
            variant,
            max_handles,
            idle_ttl,
            handles: Mutex::new(HashMap::new()),
            start_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn start_lock_for(&self, workspace_id: &WorkspaceId) -> Arc<Mutex<()>> {
        let mut locks = self.start_locks.lock().await;
        locks
            .entry(workspace_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns a client for `workspace_root`, starting a process if needed.
    pub async fn get_client(&self, workspace_root: &Path) -> Result<Arc<dyn AgentClient>> {
        let canonical = tokio::fs::canonicalize(workspace_root)
            .await
            .map_err(|e| ConductorError::validation(format!("cannot canonicalize {}: {e}", workspace_root.display())))?;
        let workspace_id = WorkspaceId::from_canonical_path(&canonical);

        let start_lock = self.start_lock_for(&workspace_id).await;
        // Only one caller gets past this guard for a given workspace at a
        // time (spec §4.E "take the handle's start-lock").
        let _guard = start_lock.lock().await;

        {
            let mut handles = self.handles.lock().await;
            if let Some(handle) = handles.get(&workspace_id) {
                if handle.client.is_healthy().await {
                    let handle = handles.get_mut(&workspace_id).expect("checked above");
                    handle.last_used_at = Instant::now();
                    return Ok(handle.client.clone());
                }
            }
        }

        let restarts = {
            let mut handles = self.handles.lock().await;
            let restarts = handles
                .get(&workspace_id)
                .map(|h| h.consecutive_restarts)
                .unwrap_or(0);
            handles.remove(&workspace_id);
            self.enforce_capacity(&mut handles, &workspace_id).await;
            restarts
        };
        if restarts > 0 {
            backoff_sleep(restarts).await;
        }
        let (client, child) = self.start(&canonical, &workspace_id).await?;

        let mut handles = self.handles.lock().await;
        handles.insert(
            workspace_id,
            Handle {
                client: client.clone(),
                child,
                last_used_at: Instant::now(),
                active_turns: 0,
                consecutive_restarts: restarts + 1,
            },
        );
        Ok(client)
    }

    async fn start(&self, cwd: &Path, workspace_id: &WorkspaceId) -> Result<(Arc<dyn AgentClient>, Option<Child>)> {
        match &self.variant {
            AgentVariant::AppServer {
                spec,
                notification_handler,
                approval_handler,
            } => {
                let env = build_env(cwd, spec, Some(workspace_id))?;
                let client = AppServerClient::spawn(
                    &spec.program,
                    &spec.args,
                    cwd,
                    &env,
                    notification_handler.clone(),
                    approval_handler.clone(),
                    spec.request_timeout,
                )
                .await?;
                Ok((Arc::new(client), None))
            }
            AgentVariant::OpenCode { spec } => {
                let env = build_env(cwd, spec, None)?;
                let mut command = tokio::process::Command::new(&spec.program);
                command
                    .args(&spec.args)
                    .current_dir(cwd)
                    .envs(&env)
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::null())
                    .stdin(std::process::Stdio::null());
                let mut child = command
                    .spawn()
                    .map_err(|e| ConductorError::fatal(format!("failed to spawn opencode: {e}")))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| ConductorError::fatal("opencode child has no stdout"))?;
                let base_url = read_listen_url(stdout, Duration::from_secs(30)).await?;
                let client = OpenCodeClient::new(&base_url, spec.request_timeout, opencode_auth())?;
                Ok((Arc::new(client), Some(child)))
            }
        }
    }

    pub async fn mark_turn_started(&self, workspace_id: &WorkspaceId) {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get_mut(workspace_id) {
            handle.active_turns += 1;
        }
    }

    pub async fn mark_turn_finished(&self, workspace_id: &WorkspaceId) {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get_mut(workspace_id) {
            handle.active_turns = handle.active_turns.saturating_sub(1);
        }
    }

    /// Evicts every handle regardless of `active_turns`; used on shutdown.
    pub async fn close_all(&self) {
        let mut handles = self.handles.lock().await;
        let drained: Vec<_> = handles.drain().collect();
        drop(handles);
        for (_, handle) in drained {
            evict(handle).await;
        }
    }

    /// Sweeps handles idle past `idle_ttl_seconds` with no active turns.
    pub async fn prune_idle(&self) {
        let mut handles = self.handles.lock().await;
        let stale: Vec<WorkspaceId> = handles
            .iter()
            .filter(|(_, h)| h.active_turns == 0 && h.last_used_at.elapsed() >= self.idle_ttl)
            .map(|(id, _)| id.clone())
            .collect();
        let mut evicted = Vec::new();
        for id in stale {
            if let Some(handle) = handles.remove(&id) {
                evicted.push(handle);
            }
        }
        drop(handles);
        for handle in evicted {
            evict(handle).await;
        }
    }

    /// LRU eviction at insertion time: if adding one more handle would
    /// exceed `max_handles`, evict the least-recently-used idle one. If none
    /// is idle, log and proceed anyway (spec: correctness over memory).
    async fn enforce_capacity(&self, handles: &mut HashMap<WorkspaceId, Handle>, incoming: &WorkspaceId) {
        if handles.contains_key(incoming) || handles.len() < self.max_handles {
            return;
        }
        let victim = handles
            .iter()
            .filter(|(_, h)| h.active_turns == 0)
            .min_by_key(|(_, h)| h.last_used_at)
            .map(|(id, _)| id.clone());
        match victim {
            Some(id) => {
                if let Some(handle) = handles.remove(&id) {
                    tokio::spawn(async move { evict(handle).await });
                }
            }
            None => {
                warn!("max_handles exceeded and no idle handle to evict; proceeding anyway");
            }
        }
    }
}

async fn evict(mut handle: Handle) {
    handle.client.shutdown().await;
    if let Some(mut child) = handle.child.take() {
        let _ = child.start_kill();
        let _ = tokio::time::timeout(EVICT_GRACE, child.wait()).await;
        let _ = child.kill().await;
    }
}

async fn backoff_sleep(attempt: u32) {
    let exp = BASE_BACKOFF.saturating_mul(1u32 << attempt.min(6));
    let capped = exp.min(MAX_BACKOFF);
    let jitter_ms = rand::rng().random_range(0..=capped.as_millis() as u64 / 4 + 1);
    tokio::time::sleep(capped + Duration::from_millis(jitter_ms)).await;
}

fn build_env(
    cwd: &Path,
    spec: &AgentStartSpec,
    workspace_id_for_home: Option<&WorkspaceId>,
) -> Result<HashMap<String, String>> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    let mut path_prefixes = vec![cwd.to_path_buf()];
    if let Ok(program_path) = which_on_path(&spec.program) {
        if let Some(parent) = program_path.parent() {
            path_prefixes.push(parent.to_path_buf());
        }
    }
    if let Some(existing) = env.get("PATH") {
        let joined = std::env::join_paths(path_prefixes.iter().map(|p| p.as_os_str()))
            .map_err(|e| ConductorError::fatal(format!("invalid PATH prefix: {e}")))?;
        let mut joined = joined.into_string().unwrap_or_default();
        joined.push(':');
        joined.push_str(existing);
        env.insert("PATH".to_string(), joined);
    }

    if let (Some(base), Some(workspace_id)) = (&spec.codex_home_base, workspace_id_for_home) {
        let codex_home = base.join(workspace_id.to_string());
        std::fs::create_dir_all(&codex_home).map_err(ConductorError::Io)?;
        seed_auth_symlink(&codex_home)?;
        env.insert(
            "CODEX_HOME".to_string(),
            codex_home.to_string_lossy().to_string(),
        );
    }
    Ok(env)
}

/// Symlinks `auth.json` from the user's home config into a per-workspace
/// `CODEX_HOME`, idempotently: never overwrites an existing credential.
fn seed_auth_symlink(codex_home: &Path) -> Result<()> {
    let link_path = codex_home.join("auth.json");
    if link_path.exists() {
        return Ok(());
    }
    let Some(home_config) = dirs::home_dir().map(|h| h.join(".codex").join("auth.json")) else {
        return Ok(());
    };
    if !home_config.exists() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        if let Err(e) = std::os::unix::fs::symlink(&home_config, &link_path) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                warn!("failed to symlink auth.json into {}: {e}", codex_home.display());
            }
        }
    }
    Ok(())
}

fn which_on_path(program: &str) -> std::io::Result<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(std::io::Error::new(std::io::ErrorKind::NotFound, program))
}

fn opencode_auth() -> Option<(String, String)> {
    match (
        std::env::var("OPENCODE_SERVER_USERNAME"),
        std::env::var("OPENCODE_SERVER_PASSWORD"),
    ) {
        (Ok(u), Ok(p)) => Some((u, p)),
        _ => None,
    }
}

/// Reads the child's stdout line by line looking for its listen URL, e.g.
/// `opencode server listening on http://127.0.0.1:4096`. The supervisor
/// owns this parsing per spec §4.D2 ("the supervisor parses it from the
/// child's stdout"); the exact announcement wording is not specified, so
/// any `http://` URL on a line is accepted.
async fn read_listen_url(stdout: tokio::process::ChildStdout, timeout: Duration) -> Result<String> {
    use tokio::io::AsyncBufReadExt;
    let mut lines = tokio::io::BufReader::new(stdout).lines();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(ConductorError::Timeout(
                "timed out waiting for opencode to announce its listen address".to_string(),
            ));
        }
        let line = tokio::time::timeout(remaining, lines.next_line())
            .await
            .map_err(|_| ConductorError::Timeout("timed out reading opencode stdout".to_string()))?
            .map_err(ConductorError::Io)?;
        let Some(line) = line else {
            return Err(ConductorError::disconnected("opencode exited before announcing a port"));
        };
        if let Some(start) = line.find("http://") {
            let url = line[start..]
                .split(|c: char| c.is_whitespace())
                .next()
                .unwrap_or_default();
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn backoff_grows_and_caps() {
        assert!(BASE_BACKOFF < MAX_BACKOFF);
    }

    #[tokio::test]
    async fn read_listen_url_extracts_http_prefix() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            writer
                .write_all(b"booting\nlistening on http://127.0.0.1:4096\n")
                .await
                .unwrap();
        });
        // read_listen_url expects a ChildStdout; exercised indirectly via
        // the line-parsing logic using a duplex stream is not directly
        // possible without a real child, so this test only checks the
        // substring-extraction rule via a local helper duplicate.
        let line = "listening on http://127.0.0.1:4096";
        let start = line.find("http://").unwrap();
        let url = line[start..].split(char::is_whitespace).next().unwrap();
        assert_eq!(url, "http://127.0.0.1:4096");
        drop(reader);
    }
}
