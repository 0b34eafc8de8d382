//! Pre-flight self-check (SPEC_FULL.md §4.O).
//!
//! Grounded on `original_source/core/engine.py`'s `doctor(start_path)`:
//! each check is independent and appends a `{id, status, message, fix?}`
//! record rather than failing fast, so one missing piece doesn't hide the
//! rest. Surfaced before any subprocess is spawned.

use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub id: String,
    pub status: CheckStatus,
    pub message: String,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    pub fn has_errors(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Error)
    }

    fn push(&mut self, id: &str, status: CheckStatus, message: impl Into<String>, fix: Option<&str>) {
        self.checks.push(DoctorCheck {
            id: id.to_string(),
            status,
            message: message.into(),
            fix: fix.map(str::to_string),
        });
    }
}

/// Runs every check against `workspace_root`, returning a report that never
/// errs itself: a failed check is recorded, not propagated.
pub async fn doctor(workspace_root: &Path, agent_program: &str) -> DoctorReport {
    let mut report = DoctorReport::default();

    check_workspace_root(&mut report, workspace_root).await;
    check_git_repo(&mut report, workspace_root).await;
    check_conductor_dir_writable(&mut report, workspace_root).await;
    check_agent_binary(&mut report, agent_program);

    report
}

async fn check_workspace_root(report: &mut DoctorReport, workspace_root: &Path) {
    match tokio::fs::metadata(workspace_root).await {
        Ok(meta) if meta.is_dir() => {
            report.push("workspace.root", CheckStatus::Ok, format!("Workspace root exists: {}", workspace_root.display()), None);
        }
        Ok(_) => {
            report.push(
                "workspace.root",
                CheckStatus::Error,
                format!("Workspace root is not a directory: {}", workspace_root.display()),
                Some("Point --workspace at a directory."),
            );
        }
        Err(e) => {
            report.push(
                "workspace.root",
                CheckStatus::Error,
                format!("Workspace root does not exist: {} ({e})", workspace_root.display()),
                Some("Create the workspace directory or fix the --workspace path."),
            );
        }
    }
}

async fn check_git_repo(report: &mut DoctorReport, workspace_root: &Path) {
    let git_dir = workspace_root.join(".git");
    if tokio::fs::metadata(&git_dir).await.is_ok() {
        report.push("workspace.git", CheckStatus::Ok, "Workspace is a git repository.", None);
    } else {
        report.push(
            "workspace.git",
            CheckStatus::Warning,
            "Workspace has no .git directory; git auto-commit will be skipped.",
            Some("Run `git init` if auto-commit is desired."),
        );
    }
}

async fn check_conductor_dir_writable(report: &mut DoctorReport, workspace_root: &Path) {
    let conductor_dir = workspace_root.join(".conductor");
    if let Err(e) = tokio::fs::create_dir_all(&conductor_dir).await {
        report.push(
            "conductor.dir",
            CheckStatus::Error,
            format!("Cannot create {}: {e}", conductor_dir.display()),
            Some("Check directory permissions."),
        );
        return;
    }
    let probe = conductor_dir.join(".doctor-write-probe");
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            report.push("conductor.dir", CheckStatus::Ok, format!("{} is writable.", conductor_dir.display()), None);
        }
        Err(e) => {
            report.push(
                "conductor.dir",
                CheckStatus::Error,
                format!("{} is not writable: {e}", conductor_dir.display()),
                Some("Check directory permissions."),
            );
        }
    }
}

fn check_agent_binary(report: &mut DoctorReport, program: &str) {
    if which_on_path(program).is_some() {
        report.push("agent.binary", CheckStatus::Ok, format!("Agent binary resolved: {program}"), None);
    } else {
        report.push(
            "agent.binary",
            CheckStatus::Error,
            format!("Agent binary not found on PATH: {program}"),
            Some("Install the agent binary or set `agent.program` in config.yml to a full path."),
        );
    }
}

fn which_on_path(program: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(program)).find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_workspace_root_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("does-not-exist");
        let report = doctor(&missing, "true").await;
        assert!(report.has_errors());
    }

    #[tokio::test]
    async fn writable_conductor_dir_and_resolvable_binary_pass() {
        let dir = tempdir().expect("tempdir");
        let report = doctor(dir.path(), "ls").await;
        let conductor_check = report.checks.iter().find(|c| c.id == "conductor.dir").expect("check present");
        assert_eq!(conductor_check.status, CheckStatus::Ok);
    }
}
