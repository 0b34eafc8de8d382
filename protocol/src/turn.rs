use serde::Deserialize;
use serde::Serialize;

use crate::ids::ThreadId;
use crate::ids::TurnId;

/// When an approval callback is invoked mid-turn, this is the reply it must
/// send back on the same correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Accept,
    Decline,
}

/// Closed approval-policy variants threaded through to `turn_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Never,
    OnRequest,
    OnFailure,
    Always,
}

impl ApprovalPolicy {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::Never => "never",
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::OnFailure => "on-failure",
            ApprovalPolicy::Always => "always",
        }
    }
}

/// Closed sandbox-policy variants threaded through to `turn_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SandboxPolicy {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxPolicy {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            SandboxPolicy::ReadOnly => "readOnly",
            SandboxPolicy::WorkspaceWrite => "workspaceWrite",
            SandboxPolicy::DangerFullAccess => "dangerFullAccess",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Failed,
    Interrupted,
    TimedOut,
}

/// Token accounting delta reported after a turn, when the agent exposes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub delta: Option<serde_json::Value>,
    pub thread_total_before: Option<serde_json::Value>,
    pub thread_total_after: Option<serde_json::Value>,
}

/// The structured result the turn orchestrator (component G) hands back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub turn_id: TurnId,
    pub thread_id: ThreadId,
    pub status: TurnStatus,
    pub agent_messages: Vec<String>,
    pub errors: Vec<String>,
    pub token_usage: Option<TokenUsage>,
}

impl TurnResult {
    pub fn output(&self) -> String {
        self.agent_messages.join("\n")
    }
}
