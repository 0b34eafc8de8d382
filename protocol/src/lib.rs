//! Shared wire-agnostic types for the conductor workspace.
//!
//! This crate has no knowledge of *how* an agent is spoken to (JSON-RPC over
//! stdio vs. HTTP+SSE); it only defines the shapes every other crate agrees
//! on: the closed [`AgentKind`] variant set, the closed [`ErrorKind`] set and
//! its [`ConductorError`] carrier, turn/thread identifiers, and the turn
//! result shape the orchestrator hands back to callers.

mod error;
mod ids;
mod turn;

pub use error::ConductorError;
pub use error::ErrorKind;
pub use error::Result;
pub use ids::FeatureKey;
pub use ids::ThreadId;
pub use ids::TurnId;
pub use ids::WorkspaceId;
pub use turn::ApprovalDecision;
pub use turn::ApprovalPolicy;
pub use turn::SandboxPolicy;
pub use turn::TurnResult;
pub use turn::TurnStatus;

use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumString;

/// The two agent backends the core knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentKind {
    CodexAppServer,
    Opencode,
}

impl AgentKind {
    pub fn all() -> &'static [AgentKind] {
        &[AgentKind::CodexAppServer, AgentKind::Opencode]
    }
}
