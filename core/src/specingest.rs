//! Spec-ingest service (spec §4.I, spec-ingest half).
//!
//! Unlike doc-chat's five independent per-kind locks, spec-ingest is a
//! single global resource: one in-process lock plus an on-disk lock under
//! (A), so a second process sees the same *Busy* as a second in-process
//! caller would.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use conductor_agent_client::TurnInput;
use conductor_protocol::ApprovalPolicy;
use conductor_protocol::ConductorError;
use conductor_protocol::FeatureKey;
use conductor_protocol::Result;
use conductor_protocol::SandboxPolicy;
use tokio::sync::Mutex;

use crate::docchat::extract_message_and_patch;
use crate::docchat::DocChatResponse;
use crate::lock;
use crate::orchestrator;
use crate::orchestrator::StopSignal;
use crate::orchestrator::TurnRequest;
use crate::patch;
use crate::supervisor::WorkspaceSupervisor;

const DEFAULT_SPEC_NAME: &str = "SPEC.md";

pub struct SpecIngestService {
    workspace_root: PathBuf,
    in_process: Mutex<()>,
    pending_interrupt: Arc<AtomicBool>,
}

impl SpecIngestService {
    pub fn new(workspace_root: PathBuf) -> Self {
        SpecIngestService {
            workspace_root,
            in_process: Mutex::new(()),
            pending_interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    fn patch_path(&self) -> PathBuf {
        self.workspace_root.join(".conductor").join("spec-ingest.patch")
    }

    fn disk_lock_path(&self) -> PathBuf {
        self.workspace_root.join(".conductor").join("spec-ingest.lock")
    }

    /// Sets the pending-interrupt flag. If a turn is currently running, its
    /// `run_turn`-issued `StopSignal` observes this on the next poll tick.
    /// If none is running, the next `execute` call aborts immediately.
    pub fn interrupt(&self) {
        self.pending_interrupt.store(true, Ordering::SeqCst);
    }

    pub async fn pending_patch(&self) -> Option<String> {
        tokio::fs::read_to_string(self.patch_path()).await.ok()
    }

    pub async fn execute(
        &self,
        supervisor: &WorkspaceSupervisor,
        threads_path: &Path,
        force: bool,
        spec_path: Option<&Path>,
        message: Option<&str>,
    ) -> Result<DocChatResponse> {
        let _in_process = self
            .in_process
            .try_lock()
            .map_err(|_| ConductorError::busy("spec-ingest is already running"))?;

        tokio::fs::create_dir_all(self.workspace_root.join(".conductor"))
            .await
            .map_err(ConductorError::Io)?;
        let _disk_lock = lock::try_acquire(&self.disk_lock_path()).await?;

        if self.pending_interrupt.swap(false, Ordering::SeqCst) && !force {
            return Err(ConductorError::Interrupted);
        }

        let spec_rel = spec_path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SPEC_NAME));
        let spec_abs = self.workspace_root.join(&spec_rel);
        let current = tokio::fs::read_to_string(&spec_abs).await.unwrap_or_default();
        let message = message.unwrap_or("Ingest the current repository state into the spec document.");

        let prompt = format!(
            "You are updating {} via spec-ingest.\nCurrent content:\n{}\n\nInstruction:\n{}\n\nReply with a short message describing the change, followed by a patch wrapped in <PATCH>...</PATCH> tags.\n",
            spec_rel.display(),
            current,
            message
        );

        let feature_key = FeatureKey::parse("spec_ingest").map_err(ConductorError::validation)?;
        let stop = StopSignal::new();
        let interrupt_flag = self.pending_interrupt.clone();
        let stop_for_poll = stop.clone();
        let poll = tokio::spawn(async move {
            loop {
                if interrupt_flag.load(Ordering::SeqCst) {
                    stop_for_poll.request();
                    break;
                }
                if stop_for_poll.is_set() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        });

        let request = TurnRequest {
            workspace_root: &self.workspace_root,
            feature_key,
            prompt: TurnInput::Text(prompt),
            model: None,
            effort: None,
            approval_policy: ApprovalPolicy::Never,
            sandbox_policy: SandboxPolicy::ReadOnly,
            timeout: Some(Duration::from_secs(30 * 60)),
            stop: stop.clone(),
        };
        let turn_result = orchestrator::run_turn(supervisor, threads_path, request).await;
        stop.request();
        poll.abort();
        let turn_result = turn_result?;

        let output = turn_result.output();
        let (agent_message, raw_patch) =
            extract_message_and_patch(&output).ok_or_else(|| ConductorError::agent_error("no patch found in agent output"))?;

        let (envelope, targets) = patch::normalize_patch_text(&raw_patch)?;
        let whitelist = vec![spec_rel.clone()];
        let normalized_targets = patch::ensure_patch_targets_allowed(&targets, &whitelist)?;
        let preview = patch::preview_patch(&self.workspace_root, &envelope, &normalized_targets)?;
        let content = preview.get(&spec_rel).cloned().unwrap_or_default();

        tokio::fs::write(self.patch_path(), &envelope).await.map_err(ConductorError::Io)?;

        Ok(DocChatResponse {
            kind: "spec".to_string(),
            agent_message,
            content,
            patch: envelope,
        })
    }

    pub async fn apply_patch(&self, spec_path: Option<&Path>) -> Result<()> {
        let spec_rel = spec_path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SPEC_NAME));
        let envelope = tokio::fs::read_to_string(self.patch_path())
            .await
            .map_err(|_| ConductorError::validation("no pending spec-ingest patch"))?;
        let whitelist = vec![spec_rel];
        let (_, targets) = patch::normalize_patch_text(&envelope)?;
        let normalized = patch::ensure_patch_targets_allowed(&targets, &whitelist)?;
        patch::apply_patch_file(&self.workspace_root, &envelope, &normalized)?;
        let _ = tokio::fs::remove_file(self.patch_path()).await;
        Ok(())
    }

    pub async fn discard_patch(&self) -> Result<()> {
        let _ = tokio::fs::remove_file(self.patch_path()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interrupt_sets_pending_flag_observed_on_next_execute() {
        let service = SpecIngestService::new(PathBuf::from("/tmp/does-not-matter"));
        assert!(!service.pending_interrupt.load(Ordering::SeqCst));
        service.interrupt();
        assert!(service.pending_interrupt.load(Ordering::SeqCst));
    }
}
