//! Autorunner run loop (spec §4.K).
//!
//! Grounded on `codex-exec`'s run-to-completion-then-report-exit-code shape,
//! looped here per the spec's pseudocode: run a turn, record telemetry,
//! persist state, decide whether to keep going.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use conductor_agent_client::TurnInput;
use conductor_protocol::ApprovalPolicy;
use conductor_protocol::ConductorError;
use conductor_protocol::FeatureKey;
use conductor_protocol::Result;
use conductor_protocol::SandboxPolicy;
use conductor_protocol::TurnStatus;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::lock;
use crate::orchestrator;
use crate::orchestrator::StopSignal;
use crate::orchestrator::TurnRequest;
use crate::runlog;
use crate::runlog::ArtifactPaths;
use crate::runlog::RunIndexEntry;
use crate::runlog::TodoCounts;
use crate::state;
use crate::state::RunStatus;
use crate::supervisor::WorkspaceSupervisor;

const SUMMARY_SENTINEL_PREFIX: &str = "<!-- CAR:SUMMARY_FINALIZED run_id=";

pub struct AutorunnerPaths {
    pub state_path: PathBuf,
    pub threads_path: PathBuf,
    pub shared_log_path: PathBuf,
    pub run_index_path: PathBuf,
    pub runs_dir: PathBuf,
    pub todo_path: PathBuf,
    pub summary_path: PathBuf,
    pub lock_path: PathBuf,
    pub stop_path: PathBuf,
}

impl AutorunnerPaths {
    pub fn new(workspace_root: &Path) -> Self {
        let conductor = workspace_root.join(".conductor");
        AutorunnerPaths {
            state_path: conductor.join("state.json"),
            threads_path: conductor.join("threads.json"),
            shared_log_path: conductor.join("conductor.log"),
            run_index_path: conductor.join("run_index.json"),
            runs_dir: conductor.join("runs"),
            todo_path: workspace_root.join("TODO.md"),
            summary_path: workspace_root.join("SUMMARY.md"),
            lock_path: conductor.join("lock"),
            stop_path: conductor.join("stop"),
        }
    }
}

/// `.conductor/lock` payload: `{pid, started_at, host}` (spec §4.K).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct InstancePayload {
    pid: u32,
    started_at: String,
    host: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// `TODO.md` parses as done when it has no unchecked `- [ ]` items.
fn todo_done(contents: &str) -> bool {
    !contents.lines().any(|line| line.trim_start().starts_with("- [ ]"))
}

fn summary_finalized(contents: &str) -> bool {
    contents.contains(SUMMARY_SENTINEL_PREFIX)
}

fn count_todo_items(contents: &str) -> TodoCounts {
    let mut counts = TodoCounts::default();
    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("- [x]") || trimmed.starts_with("- [X]") {
            counts.completed += 1;
        }
    }
    counts
}

pub struct AutorunnerOptions {
    pub stop_after_runs: Option<u64>,
}

/// Runs the autorunner loop to completion (or until stopped/errored).
/// Returns the final exit code the CLI should surface.
pub async fn run(
    supervisor: &WorkspaceSupervisor,
    workspace_root: &Path,
    config: &Config,
    options: AutorunnerOptions,
) -> Result<i32> {
    let paths = AutorunnerPaths::new(workspace_root);
    tokio::fs::create_dir_all(&paths.runs_dir).await.map_err(ConductorError::Io)?;

    let _instance_lock = lock::try_acquire(&paths.lock_path).await?;
    let payload = InstancePayload {
        pid: std::process::id(),
        started_at: now_rfc3339(),
        host: hostname(),
    };
    let payload_bytes = serde_json::to_vec_pretty(&payload).map_err(ConductorError::Json)?;
    lock::atomic_write(&paths.lock_path, &payload_bytes).await?;

    let _ = tokio::fs::remove_file(&paths.stop_path).await;

    let start_wallclock = Instant::now();
    let max_wallclock = config.timeouts.autorunner_max_wallclock_seconds;
    let stop_after_runs = options.stop_after_runs.or(config.timeouts.autorunner_stop_after_runs);

    let guard = state::state_lock(&paths.state_path).await?;
    let mut runner_state = state::load(&paths.state_path).await?;
    let mut run_id = runner_state.last_run_id + 1;
    runner_state.status = RunStatus::Running;
    runner_state.runner_pid = Some(std::process::id());
    state::save(&paths.state_path, &runner_state).await?;
    drop(guard);

    let mut prev_output = String::new();
    let mut exit_code = 0;

    loop {
        if tokio::fs::metadata(&paths.stop_path).await.is_ok() {
            info!(run_id, "autorunner stop requested, breaking");
            break;
        }
        if max_wallclock > 0 && start_wallclock.elapsed() >= Duration::from_secs(max_wallclock) {
            info!(run_id, "autorunner max wallclock exceeded, breaking");
            break;
        }

        let todo_contents = tokio::fs::read_to_string(&paths.todo_path).await.unwrap_or_default();
        if todo_done(&todo_contents) {
            let summary_contents = tokio::fs::read_to_string(&paths.summary_path).await.unwrap_or_default();
            if !summary_finalized(&summary_contents) {
                exit_code = run_final_summary_turn(supervisor, workspace_root, &paths, config, run_id).await?;
            }
            break;
        }

        let prompt = build_autorunner_prompt(&prev_output, config);
        let step = execute_run_step(supervisor, workspace_root, &paths, config, run_id, &prompt, &todo_contents).await?;
        exit_code = step.exit_code;
        prev_output = step.output;

        let mut guard_state = state::load(&paths.state_path).await?;
        guard_state.last_run_id = run_id;
        guard_state.last_exit_code = Some(exit_code);
        guard_state.last_run_finished_at = Some(now_rfc3339());
        guard_state.status = if exit_code == 0 { RunStatus::Idle } else { RunStatus::Error };
        state::save(&paths.state_path, &guard_state).await?;

        if exit_code != 0 {
            error!(run_id, exit_code, "autorunner turn failed, breaking");
            break;
        }

        let todo_contents = tokio::fs::read_to_string(&paths.todo_path).await.unwrap_or_default();
        if todo_done(&todo_contents) {
            let summary_contents = tokio::fs::read_to_string(&paths.summary_path).await.unwrap_or_default();
            if !summary_finalized(&summary_contents) {
                exit_code = run_final_summary_turn(supervisor, workspace_root, &paths, config, run_id + 1).await?;
            }
            break;
        }

        if let Some(limit) = stop_after_runs {
            if run_id >= limit {
                info!(run_id, limit, "autorunner stop_after_runs reached, breaking");
                break;
            }
        }

        run_id += 1;
        tokio::time::sleep(Duration::from_secs(config.timeouts.autorunner_sleep_seconds)).await;
    }

    let mut final_state = state::load(&paths.state_path).await?;
    final_state.status = if exit_code == 0 { RunStatus::Idle } else { RunStatus::Error };
    final_state.runner_pid = None;
    state::save(&paths.state_path, &final_state).await?;

    maybe_git_auto_commit(workspace_root, config, run_id).await;

    Ok(exit_code)
}

struct RunStepResult {
    exit_code: i32,
    output: String,
}

fn build_autorunner_prompt(prev_output: &str, config: &Config) -> String {
    let bounded = runlog::extract_prev_run_output(prev_output, config.prompt.prompt_prev_run_max_chars);
    if bounded.is_empty() {
        "Continue working through TODO.md. Mark items done as you complete them.".to_string()
    } else {
        format!(
            "Previous run output:\n{bounded}\n\nContinue working through TODO.md. Mark items done as you complete them."
        )
    }
}

async fn execute_run_step(
    supervisor: &WorkspaceSupervisor,
    workspace_root: &Path,
    paths: &AutorunnerPaths,
    config: &Config,
    run_id: u64,
    prompt: &str,
    todo_before: &str,
) -> Result<RunStepResult> {
    let start_offset = runlog::start_run_block(&paths.shared_log_path, run_id).await?;
    let started_at = now_rfc3339();

    let feature_key = FeatureKey::parse("autorunner").map_err(ConductorError::validation)?;
    let request = TurnRequest {
        workspace_root,
        feature_key,
        prompt: TurnInput::Text(prompt.to_string()),
        model: None,
        effort: None,
        approval_policy: ApprovalPolicy::OnFailure,
        sandbox_policy: SandboxPolicy::WorkspaceWrite,
        timeout: Some(Duration::from_secs(config.timeouts.turn_timeout_seconds)),
        stop: StopSignal::new(),
    };

    let turn_result = orchestrator::run_turn(supervisor, &paths.threads_path, request).await;

    let (exit_code, output, thread_id, turn_id) = match &turn_result {
        Ok(result) => {
            let code = match result.status {
                TurnStatus::Completed => 0,
                TurnStatus::Interrupted | TurnStatus::TimedOut => 1,
                TurnStatus::Failed => 1,
            };
            (code, result.output(), Some(result.thread_id.clone()), Some(result.turn_id.clone()))
        }
        Err(e) => {
            warn!(run_id, error = %e, "autorunner turn failed");
            (1, e.to_string(), None, None)
        }
    };

    runlog::append_shared_log(&paths.shared_log_path, &format!("{output}\n")).await?;
    runlog::end_run_block(&paths.shared_log_path, &paths.run_index_path, run_id, exit_code, &now_rfc3339()).await?;

    let todo_after = tokio::fs::read_to_string(&paths.todo_path).await.unwrap_or_default();

    let guard = state::state_lock(&paths.run_index_path).await?;
    let mut index = runlog::load_index(&paths.run_index_path).await?;
    index.insert(
        run_id,
        RunIndexEntry {
            start_offset,
            end_offset: None,
            started_at,
            finished_at: Some(now_rfc3339()),
            exit_code: Some(exit_code),
            log_path: paths.shared_log_path.clone(),
            run_log_path: paths.runs_dir.join(format!("run-{run_id}.log")),
            app_server: runlog::AppServerMeta {
                thread_id: thread_id.map(|t| t.0),
                turn_id: turn_id.map(|t| t.0),
                model: None,
                provider: None,
                reasoning_effort: None,
            },
            token_usage: runlog::TokenUsageMeta::default(),
            artifacts: ArtifactPaths {
                plan_path: None,
                diff_path: None,
            },
            todo: count_todo_items(&todo_after),
            todo_snapshot_before: Some(todo_before.to_string()),
            todo_snapshot_after: Some(todo_after),
        },
    );
    runlog::save_index(&paths.run_index_path, &index).await?;
    drop(guard);

    Ok(RunStepResult { exit_code, output })
}

async fn run_final_summary_turn(
    supervisor: &WorkspaceSupervisor,
    workspace_root: &Path,
    paths: &AutorunnerPaths,
    config: &Config,
    run_id: u64,
) -> Result<i32> {
    let prompt = format!(
        "TODO.md is complete. Write a final summary of the work done into SUMMARY.md, ending with the line `{SUMMARY_SENTINEL_PREFIX}{run_id} -->`."
    );
    let todo_before = tokio::fs::read_to_string(&paths.todo_path).await.unwrap_or_default();
    let step = execute_run_step(supervisor, workspace_root, paths, config, run_id, &prompt, &todo_before).await?;
    Ok(step.exit_code)
}

async fn maybe_git_auto_commit(workspace_root: &Path, config: &Config, run_id: u64) {
    if !config.git.auto_commit {
        return;
    }
    let message = config.git.commit_message_template.replace("{run_id}", &run_id.to_string());
    let add = tokio::process::Command::new("git")
        .arg("add")
        .arg("-A")
        .current_dir(workspace_root)
        .output()
        .await;
    if let Err(e) = add {
        warn!(run_id, error = %e, "git add failed during autorunner auto-commit");
        return;
    }
    let commit = tokio::process::Command::new("git")
        .arg("commit")
        .arg("-m")
        .arg(&message)
        .current_dir(workspace_root)
        .output()
        .await;
    if let Err(e) = commit {
        warn!(run_id, error = %e, "git commit failed during autorunner auto-commit");
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("host-{}", unix_seconds()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todo_done_requires_no_unchecked_items() {
        assert!(todo_done("# TODO\n- [x] done\n"));
        assert!(!todo_done("# TODO\n- [ ] pending\n"));
    }

    #[test]
    fn summary_finalized_detects_sentinel() {
        assert!(summary_finalized("Work done.\n<!-- CAR:SUMMARY_FINALIZED run_id=3 -->\n"));
        assert!(!summary_finalized("Work done.\n"));
    }
}
