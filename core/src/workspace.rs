//! Per-workspace context: one [`WorkspaceSupervisor`] per [`AgentKind`],
//! wired to a shared [`EventBuffer`] and the workspace's loaded [`Config`].
//!
//! Grounded on SPEC_FULL.md §9's design note that the core construct one
//! supervisor per agent kind and hold it for the process lifetime, rather
//! than spin one up per call; the actual handle-map lives in (E), this is
//! just the assembly point the CLI constructs once at startup.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conductor_agent_client::AlwaysDecline;
use conductor_agent_client::ApprovalHandler;
use conductor_agent_client::NotificationHandler;
use conductor_protocol::AgentKind;
use conductor_protocol::ThreadId;
use conductor_protocol::TurnId;
use tracing::debug;

use crate::config::Config;
use crate::events::EventBuffer;
use crate::supervisor::AgentStartSpec;
use crate::supervisor::AgentVariant;
use crate::supervisor::WorkspaceSupervisor;

/// Forwards every app-server notification into the shared [`EventBuffer`],
/// keyed by the `thread_id`/`turn_id` fields the notification carries (when
/// present). Notifications that do not identify a turn are logged and
/// dropped; (F) has no "unscoped" subscription concept.
struct EventForwarder {
    events: Arc<EventBuffer>,
}

#[async_trait::async_trait]
impl NotificationHandler for EventForwarder {
    async fn handle_notification(&self, method: &str, params: Option<serde_json::Value>) {
        let ids = params.as_ref().and_then(extract_turn_ids);
        match ids {
            Some((thread_id, turn_id)) => {
                self.events.publish(thread_id, turn_id, method, params).await;
            }
            None => debug!(method, "notification without thread/turn correlation, dropping"),
        }
    }
}

fn extract_turn_ids(params: &serde_json::Value) -> Option<(ThreadId, TurnId)> {
    let thread_id = params.get("threadId").or_else(|| params.get("thread_id"))?.as_str()?;
    let turn_id = params.get("turnId").or_else(|| params.get("turn_id"))?.as_str()?;
    Some((ThreadId(thread_id.to_string()), TurnId(turn_id.to_string())))
}

/// Everything a single workspace's CLI invocation needs: the loaded config,
/// the path layout, the shared event hub, and one supervisor per agent kind
/// (constructed lazily so `conductor doctor` doesn't have to spawn anything).
pub struct WorkspaceContext {
    pub workspace_root: PathBuf,
    pub config: Config,
    pub events: Arc<EventBuffer>,
    app_server: Arc<WorkspaceSupervisor>,
    opencode: Arc<WorkspaceSupervisor>,
}

impl WorkspaceContext {
    pub async fn load(workspace_root: &Path) -> conductor_protocol::Result<Self> {
        let config_path = workspace_root.join(".conductor").join("config.yml");
        let config = Config::load(&config_path).await?;
        let events = EventBuffer::new();

        let request_timeout = Duration::from_secs(config.timeouts.turn_timeout_seconds);
        let codex_home_base = dirs::data_dir().map(|d| d.join("conductor").join("codex-homes"));

        let app_server_spec = AgentStartSpec {
            program: config.agent.program.clone(),
            args: config.agent.args.clone(),
            request_timeout,
            codex_home_base,
        };
        let app_server = WorkspaceSupervisor::new(
            AgentVariant::AppServer {
                spec: app_server_spec,
                notification_handler: Arc::new(EventForwarder { events: events.clone() }),
                approval_handler: default_approval_handler(),
            },
            config.supervisor.max_handles,
            Duration::from_secs(config.supervisor.idle_ttl_seconds),
        );

        let opencode_spec = AgentStartSpec {
            program: "opencode".to_string(),
            args: vec!["serve".to_string()],
            request_timeout,
            codex_home_base: None,
        };
        let opencode = WorkspaceSupervisor::new(
            AgentVariant::OpenCode { spec: opencode_spec },
            config.supervisor.max_handles,
            Duration::from_secs(config.supervisor.idle_ttl_seconds),
        );

        Ok(WorkspaceContext {
            workspace_root: workspace_root.to_path_buf(),
            config,
            events,
            app_server,
            opencode,
        })
    }

    pub fn supervisor(&self, kind: AgentKind) -> &Arc<WorkspaceSupervisor> {
        match kind {
            AgentKind::CodexAppServer => &self.app_server,
            AgentKind::Opencode => &self.opencode,
        }
    }

    /// Tears down every live agent process across both supervisors.
    pub async fn shutdown(&self) {
        self.app_server.close_all().await;
        self.opencode.close_all().await;
    }
}

/// The approval handler is bound once at supervisor construction and never
/// swapped per turn (spec §9 "monkey-patched approval handlers → explicit
/// callback slot"). With no interactive surface in this batch CLI to
/// delegate an `on-request`/`always` decision to, every agent kind shares
/// this single conservative handler: decline uniformly, regardless of the
/// policy a given turn was started with. An autorunner/ticket-flow turn that
/// needs a file-change or command-execution approval simply fails closed
/// instead of hanging for a human who isn't there.
fn default_approval_handler() -> Arc<dyn ApprovalHandler> {
    Arc::new(AlwaysDecline)
}
