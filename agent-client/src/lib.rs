//! Wire-protocol clients for the two agent backends the core can drive.
//!
//! [`app_server`] implements the JSON-RPC-over-stdio protocol (spec §4.D1);
//! [`opencode`] implements the HTTP+REST+SSE protocol (spec §4.D2). Both are
//! exposed behind the single [`AgentClient`] capability interface so the
//! supervisor and turn orchestrator never need to know which variant they
//! are holding.

pub mod app_server;
pub mod opencode;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use conductor_protocol::ApprovalDecision;
use conductor_protocol::ApprovalPolicy;
use conductor_protocol::ConductorError;
use conductor_protocol::Result;
use conductor_protocol::SandboxPolicy;
use conductor_protocol::ThreadId;
use conductor_protocol::TurnId;
use conductor_protocol::TurnResult;

/// Input to a turn: either a single prompt string or a list of structured
/// input items (images, file refs, ...) passed through to the agent as-is.
#[derive(Debug, Clone)]
pub enum TurnInput {
    Text(String),
    Items(Vec<serde_json::Value>),
}

impl From<String> for TurnInput {
    fn from(s: String) -> Self {
        TurnInput::Text(s)
    }
}

impl From<&str> for TurnInput {
    fn from(s: &str) -> Self {
        TurnInput::Text(s.to_string())
    }
}

/// A started thread, with the backend's view of the cwd it was opened in.
#[derive(Debug, Clone)]
pub struct StartedThread {
    pub thread_id: ThreadId,
    pub cwd: Option<String>,
}

/// One page of a (possibly paginated) thread listing.
#[derive(Debug, Clone, Default)]
pub struct ThreadListPage {
    pub thread_ids: Vec<ThreadId>,
    pub next_cursor: Option<String>,
}

/// Callback invoked for every inbound notification / server-initiated
/// non-approval request. Never substituted post-construction (spec §9).
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle_notification(&self, method: &str, params: Option<serde_json::Value>);
}

/// Callback invoked when the agent asks for an approval mid-turn. The
/// contract (spec §4.D1) forbids silently dropping this: the agent blocks
/// until a reply with the matching correlation id is observed, so every
/// implementation of this trait must always resolve to a decision.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn handle_approval(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> ApprovalDecision;
}

/// An approval handler that always declines; used by doc-chat/spec-ingest
/// per spec §4.I ("refuses any file change not in the whitelist and refuses
/// any command execution").
pub struct AlwaysDecline;

#[async_trait]
impl ApprovalHandler for AlwaysDecline {
    async fn handle_approval(
        &self,
        _method: &str,
        _params: Option<serde_json::Value>,
    ) -> ApprovalDecision {
        ApprovalDecision::Decline
    }
}

/// A live turn in progress: lets the orchestrator wait on completion
/// independently of issuing the interrupt.
#[async_trait]
pub trait TurnHandle: Send + Sync {
    fn thread_id(&self) -> &ThreadId;
    fn turn_id(&self) -> &TurnId;

    /// Waits for the turn to finish, or for `timeout` to elapse (returning
    /// `ConductorError::Timeout` in that case). The caller is responsible for
    /// racing this against its own stop signal (spec §4.G step 5).
    async fn wait(&mut self, timeout: Option<Duration>) -> Result<TurnResult>;
}

/// The capability interface both agent backends implement (spec §9,
/// "duck-typed client polymorphism → capability interface").
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn thread_start(
        &self,
        cwd: &Path,
        approval_policy: ApprovalPolicy,
        sandbox: SandboxPolicy,
    ) -> Result<StartedThread>;

    async fn thread_resume(&self, thread_id: &ThreadId) -> Result<StartedThread>;

    async fn thread_list(
        &self,
        cwd: Option<&Path>,
        cursor: Option<&str>,
    ) -> Result<ThreadListPage>;

    async fn turn_start(
        &self,
        thread_id: &ThreadId,
        input: TurnInput,
        approval_policy: ApprovalPolicy,
        sandbox: SandboxPolicy,
        model: Option<&str>,
        effort: Option<&str>,
    ) -> Result<Box<dyn TurnHandle>>;

    async fn turn_interrupt(&self, turn_id: &TurnId, thread_id: &ThreadId) -> Result<()>;

    /// True once the underlying process/endpoint is known to be reachable.
    /// The supervisor uses this as its health probe.
    async fn is_healthy(&self) -> bool;

    /// Best-effort shutdown; supervisor calls this before SIGKILL.
    async fn shutdown(&self);
}

pub(crate) fn timeout_err(what: &str, dur: Duration) -> ConductorError {
    ConductorError::Timeout(format!("{what} timed out after {dur:?}"))
}
