//! Repo snapshot generation (spec §6.4 `snapshot.generate_snapshot()`).
//!
//! Grounded on `original_source/core/snapshot.py` and its
//! `SNAPSHOT_APP_SERVER_TEMPLATE` prompt: unlike doc-chat/spec-ingest, the
//! agent writes `SNAPSHOT.md` directly rather than through a reviewed patch,
//! since a snapshot has no prior version worth diffing against.

use std::path::Path;
use std::time::Duration;

use conductor_agent_client::TurnInput;
use conductor_protocol::ApprovalPolicy;
use conductor_protocol::ConductorError;
use conductor_protocol::FeatureKey;
use conductor_protocol::Result;
use conductor_protocol::SandboxPolicy;

use crate::orchestrator;
use crate::orchestrator::StopSignal;
use crate::orchestrator::TurnRequest;
use crate::supervisor::WorkspaceSupervisor;

const SNAPSHOT_FILENAME: &str = "SNAPSHOT.md";

fn build_prompt(snapshot_path: &str) -> String {
    format!(
        "You are generating a compact Markdown repo snapshot meant to be pasted into another LLM chat.\n\n\
Snapshot path: {snapshot_path}\n\n\
Instructions:\n\
- Analyze the repository.\n\
- Write the snapshot content directly to the snapshot path.\n\
- Keep the file concise and high-signal.\n\n\
Required output format (keep headings exactly):\n\
# Repo Snapshot\n\n\
## What this repo is\n\
- 3-6 bullets.\n\n\
## Architecture overview\n\
- Components and responsibilities.\n\
- Data/control flow (high level).\n\n\
## Key files and modules\n\
- Bullet list of important paths with 1-line notes.\n\n\
## Extension points and sharp edges\n\
- Config/state/concurrency hazards, limits, sharp edges.\n"
    )
}

/// Runs a single turn asking the agent to (re)write `SNAPSHOT.md` in place.
/// Returns the agent's final message.
pub async fn generate_snapshot(supervisor: &WorkspaceSupervisor, workspace_root: &Path, threads_path: &Path) -> Result<String> {
    let feature_key = FeatureKey::parse("snapshot").map_err(ConductorError::validation)?;
    let prompt = build_prompt(SNAPSHOT_FILENAME);

    let request = TurnRequest {
        workspace_root,
        feature_key,
        prompt: TurnInput::Text(prompt),
        model: None,
        effort: None,
        approval_policy: ApprovalPolicy::OnFailure,
        sandbox_policy: SandboxPolicy::WorkspaceWrite,
        timeout: Some(Duration::from_secs(15 * 60)),
        stop: StopSignal::new(),
    };
    let turn_result = orchestrator::run_turn(supervisor, threads_path, request).await?;
    Ok(turn_result.output())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_keeps_required_headings() {
        let prompt = build_prompt(SNAPSHOT_FILENAME);
        assert!(prompt.contains("# Repo Snapshot"));
        assert!(prompt.contains("## Architecture overview"));
        assert!(prompt.contains(SNAPSHOT_FILENAME));
    }
}
