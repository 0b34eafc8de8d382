//! Turn orchestration (spec §4.G): create-or-resume, start, stream, time
//! out, cancel, and summarize one agent turn.
//!
//! Grounded on `codex-core::codex::submission_loop`'s start/stream/interrupt
//! shape, flattened here into a single async function since the agent-client
//! crate already owns the request/response and notification plumbing.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use conductor_agent_client::AgentClient;
use conductor_agent_client::TurnInput;
use conductor_protocol::ApprovalPolicy;
use conductor_protocol::ConductorError;
use conductor_protocol::FeatureKey;
use conductor_protocol::Result;
use conductor_protocol::SandboxPolicy;
use conductor_protocol::ThreadId;
use conductor_protocol::TurnResult;
use conductor_protocol::TurnStatus;
use conductor_protocol::WorkspaceId;
use tracing::info;
use tracing::warn;

use crate::supervisor::WorkspaceSupervisor;
use crate::threads;

const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(8 * 60 * 60);
const INTERRUPT_GRACE: Duration = Duration::from_secs(30);

/// A cooperative stop signal: set once, observed by every long wait in the
/// orchestrator (spec §5 "cancellation semantics").
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        StopSignal(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct TurnRequest<'a> {
    pub workspace_root: &'a Path,
    pub feature_key: FeatureKey,
    pub prompt: TurnInput,
    pub model: Option<&'a str>,
    pub effort: Option<&'a str>,
    pub approval_policy: ApprovalPolicy,
    pub sandbox_policy: SandboxPolicy,
    pub timeout: Option<Duration>,
    pub stop: StopSignal,
}

/// Drives one turn per spec §4.G's 8-step sequence. `threads_path` is the
/// per-workspace thread registry file backing (C).
pub async fn run_turn(
    supervisor: &WorkspaceSupervisor,
    threads_path: &Path,
    request: TurnRequest<'_>,
) -> Result<TurnResult> {
    let canonical = tokio::fs::canonicalize(request.workspace_root)
        .await
        .map_err(|e| ConductorError::validation(format!("cannot canonicalize workspace root: {e}")))?;
    let workspace_id = WorkspaceId::from_canonical_path(&canonical);

    // Step 2: obtain a client, resolve/resume the feature's thread.
    let client = supervisor.get_client(&canonical).await?;
    let thread_id = resolve_thread(&client, threads_path, &request.feature_key, &canonical, &request).await?;

    // Step 3: increment active-turns.
    supervisor.mark_turn_started(&workspace_id).await;
    let result = drive_turn(client.as_ref(), &thread_id, &request).await;
    // Step 8: decrement active-turns regardless of outcome.
    supervisor.mark_turn_finished(&workspace_id).await;

    result
}

async fn resolve_thread(
    client: &Arc<dyn AgentClient>,
    threads_path: &Path,
    feature_key: &FeatureKey,
    cwd: &Path,
    request: &TurnRequest<'_>,
) -> Result<ThreadId> {
    let _lock = threads::state_lock(threads_path).await?;
    let mut map = threads::load(threads_path).await?;

    if let Some(existing) = map.get(feature_key) {
        match client.thread_resume(&existing).await {
            Ok(started) => return Ok(started.thread_id),
            Err(e) => {
                warn!(feature_key = %feature_key, error = %e, "thread resume failed, starting fresh");
                map.reset(feature_key);
                threads::save(threads_path, &map).await?;
            }
        }
    }

    let started = client
        .thread_start(cwd, request.approval_policy, request.sandbox_policy)
        .await?;
    map.set(feature_key, started.thread_id.clone());
    threads::save(threads_path, &map).await?;
    Ok(started.thread_id)
}

async fn drive_turn(client: &dyn AgentClient, thread_id: &ThreadId, request: &TurnRequest<'_>) -> Result<TurnResult> {
    // Step 4: start the turn.
    let mut handle = client
        .turn_start(
            thread_id,
            request.prompt.clone(),
            request.approval_policy,
            request.sandbox_policy,
            request.model,
            request.effort,
        )
        .await?;
    let turn_id = handle.turn_id().clone();
    info!(thread_id = %thread_id, turn_id = %turn_id, "turn started");

    let timeout = request.timeout.unwrap_or(DEFAULT_TURN_TIMEOUT);
    let stop = request.stop.clone();

    // Step 5: race completion against the stop signal and the timeout.
    // `TurnHandle::wait` already enforces the timeout internally; we additionally
    // poll the stop signal at a 1s cadence per spec §5's "stop poll interval".
    let wait_fut = handle.wait(Some(timeout));
    tokio::pin!(wait_fut);
    let outcome = loop {
        tokio::select! {
            result = &mut wait_fut => break result,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if stop.is_set() {
                    break Err(ConductorError::Interrupted);
                }
            }
        }
    };

    match outcome {
        Ok(result) => Ok(result),
        Err(ConductorError::Interrupted) => interrupt_and_finalize(client, thread_id, &turn_id, handle).await,
        Err(ConductorError::Timeout(detail)) => {
            let mut result = interrupt_and_finalize(client, thread_id, &turn_id, handle).await?;
            result.status = TurnStatus::TimedOut;
            result.errors.push(detail);
            Ok(result)
        }
        Err(e) => Err(e),
    }
}

// Step 6: issue `turn_interrupt` and wait up to the grace window.
async fn interrupt_and_finalize(
    client: &dyn AgentClient,
    thread_id: &ThreadId,
    turn_id: &conductor_protocol::TurnId,
    mut handle: Box<dyn conductor_agent_client::TurnHandle>,
) -> Result<TurnResult> {
    client.turn_interrupt(turn_id, thread_id).await?;
    match handle.wait(Some(INTERRUPT_GRACE)).await {
        Ok(mut result) => {
            result.status = TurnStatus::Interrupted;
            Ok(result)
        }
        Err(_) => {
            client.shutdown().await;
            Err(ConductorError::Fatal(format!(
                "turn {turn_id} on thread {thread_id} did not finalize within the interrupt grace window"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_round_trips() {
        let stop = StopSignal::new();
        assert!(!stop.is_set());
        stop.request();
        assert!(stop.is_set());
    }
}
