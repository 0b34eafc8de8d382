//! `conductor`: a thin CLI over `conductor-core`'s upward contracts (spec
//! §4.N). Grounded on `codex-cli`'s `clap` + `derive` subcommand shape.

use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use conductor_core::autorunner;
use conductor_core::autorunner::AutorunnerOptions;
use conductor_core::docchat::DocChatService;
use conductor_core::doctor;
use conductor_core::flow::FlowStatus;
use conductor_core::flow::FlowStore;
use conductor_core::snapshot;
use conductor_core::specingest::SpecIngestService;
use conductor_core::tickets;
use conductor_core::tickets::TicketFlowPaths;
use conductor_core::tickets::TicketFlowState;
use conductor_core::workspace::WorkspaceContext;
use conductor_protocol::AgentKind;

#[derive(Parser)]
#[command(name = "conductor", about = "Autonomous coding-assistant orchestrator")]
struct Cli {
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive the autorunner loop for a workspace.
    Autorunner {
        #[command(subcommand)]
        action: AutorunnerAction,
    },
    /// Converse with an agent about a single workspace doc (TODO/PROGRESS/OPINIONS/SPEC/SUMMARY).
    DocChat {
        kind: String,
        message: Option<String>,
        #[arg(long, conflicts_with = "discard")]
        apply: bool,
        #[arg(long)]
        discard: bool,
    },
    /// Ingest the repository state into SPEC.md (or a configured spec path).
    SpecIngest {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        spec_path: Option<PathBuf>,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        apply: bool,
        #[arg(long)]
        discard: bool,
        #[arg(long)]
        interrupt: bool,
    },
    /// Advance the ticket-flow state machine by one step.
    Tickets {
        #[command(subcommand)]
        action: TicketsAction,
    },
    /// Operate on a durable flow run.
    Flow {
        #[command(subcommand)]
        action: FlowAction,
    },
    /// Generate a compact Markdown snapshot of the repository.
    Snapshot,
    /// Pre-flight self-check: workspace layout, git, writability, agent binary.
    Doctor,
}

#[derive(Subcommand)]
enum AutorunnerAction {
    Run {
        #[arg(long)]
        stop_after_runs: Option<u64>,
    },
    Stop,
    Status,
}

#[derive(Subcommand)]
enum TicketsAction {
    Step,
}

#[derive(Subcommand)]
enum FlowAction {
    Start {
        #[arg(long)]
        flow_type: String,
        #[arg(long, default_value = "{}")]
        input_json: String,
    },
    Stop {
        #[arg(long)]
        run_id: i64,
    },
    Resume {
        #[arg(long)]
        run_id: i64,
    },
    Status {
        #[arg(long)]
        run_id: i64,
    },
    Events {
        #[arg(long)]
        run_id: i64,
        #[arg(long)]
        after_seq: Option<i64>,
    },
}

fn flows_db_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".conductor").join("flows.sqlite3")
}

fn ticket_state_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".conductor").join("ticket_flow_state.json")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let workspace_root = cli.workspace.canonicalize().unwrap_or(cli.workspace.clone());

    match cli.command {
        Command::Autorunner { action } => run_autorunner(&workspace_root, action).await,
        Command::DocChat { kind, message, apply, discard } => run_doc_chat(&workspace_root, kind, message, apply, discard).await,
        Command::SpecIngest { force, spec_path, message, apply, discard, interrupt } => {
            run_spec_ingest(&workspace_root, force, spec_path, message, apply, discard, interrupt).await
        }
        Command::Tickets { action: TicketsAction::Step } => run_tickets_step(&workspace_root).await,
        Command::Flow { action } => run_flow(&workspace_root, action).await,
        Command::Snapshot => run_snapshot(&workspace_root).await,
        Command::Doctor => run_doctor(&workspace_root).await,
    }
}

async fn run_autorunner(workspace_root: &Path, action: AutorunnerAction) -> anyhow::Result<()> {
    let paths = autorunner::AutorunnerPaths::new(workspace_root);
    match action {
        AutorunnerAction::Run { stop_after_runs } => {
            let context = WorkspaceContext::load(workspace_root).await?;
            let report = doctor::doctor(workspace_root, &context.config.agent.program).await;
            if report.has_errors() {
                println!("{}", serde_json::to_string_pretty(&report)?);
                anyhow::bail!("doctor checks failed, refusing to start autorunner");
            }
            let supervisor = context.supervisor(AgentKind::CodexAppServer);
            let exit_code = autorunner::run(supervisor, workspace_root, &context.config, AutorunnerOptions { stop_after_runs }).await?;
            context.shutdown().await;
            std::process::exit(exit_code);
        }
        AutorunnerAction::Stop => {
            tokio::fs::create_dir_all(paths.stop_path.parent().unwrap_or(Path::new("."))).await?;
            tokio::fs::write(&paths.stop_path, b"stop requested\n").await?;
            println!("stop requested");
            Ok(())
        }
        AutorunnerAction::Status => {
            let state = conductor_core::state::load(&paths.state_path).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
    }
}

async fn run_doc_chat(workspace_root: &Path, kind: String, message: Option<String>, apply: bool, discard: bool) -> anyhow::Result<()> {
    let service = DocChatService::new(workspace_root.to_path_buf());
    if apply {
        service.apply(&kind).await?;
        println!("applied doc-chat patch for {kind}");
        return Ok(());
    }
    if discard {
        service.discard().await?;
        println!("discarded doc-chat patch for {kind}");
        return Ok(());
    }
    let message = message.ok_or_else(|| anyhow::anyhow!("a message is required unless --apply or --discard is passed"))?;
    let context = WorkspaceContext::load(workspace_root).await?;
    let supervisor = context.supervisor(AgentKind::CodexAppServer);
    let threads_path = workspace_root.join(".conductor").join("threads.json");
    let response = service.execute(supervisor, &threads_path, &kind, &message).await?;
    println!("{}", response.agent_message);
    println!("--- proposed content for this kind ---");
    println!("{}", response.content);
    context.shutdown().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_spec_ingest(
    workspace_root: &Path,
    force: bool,
    spec_path: Option<PathBuf>,
    message: Option<String>,
    apply: bool,
    discard: bool,
    interrupt: bool,
) -> anyhow::Result<()> {
    let service = SpecIngestService::new(workspace_root.to_path_buf());
    if interrupt {
        service.interrupt();
        println!("interrupt requested");
        return Ok(());
    }
    if apply {
        service.apply_patch(spec_path.as_deref()).await?;
        println!("applied spec-ingest patch");
        return Ok(());
    }
    if discard {
        service.discard_patch().await?;
        println!("discarded spec-ingest patch");
        return Ok(());
    }
    let context = WorkspaceContext::load(workspace_root).await?;
    let supervisor = context.supervisor(AgentKind::CodexAppServer);
    let threads_path = workspace_root.join(".conductor").join("threads.json");
    let response = service
        .execute(supervisor, &threads_path, force, spec_path.as_deref(), message.as_deref())
        .await?;
    println!("{}", response.agent_message);
    context.shutdown().await;
    Ok(())
}

async fn run_tickets_step(workspace_root: &Path) -> anyhow::Result<()> {
    let ticket_dir = workspace_root.join(".conductor").join("tickets");
    let run_dir = workspace_root.join(".conductor").join("current_run");
    let threads_path = workspace_root.join(".conductor").join("threads.json");
    let paths = TicketFlowPaths {
        ticket_dir: ticket_dir.clone(),
        repo_root: workspace_root.to_path_buf(),
        run_dir,
        threads_path,
    };

    let state_path = ticket_state_path(workspace_root);
    let mut state = load_ticket_state(&state_path).await?;

    let tickets_list = tickets::scan_tickets(&ticket_dir).await?;
    let agent_kind = tickets_list
        .iter()
        .find(|t| !t.front_matter.done)
        .map(|t| if t.front_matter.agent == "opencode" { AgentKind::Opencode } else { AgentKind::CodexAppServer })
        .unwrap_or(AgentKind::CodexAppServer);

    let context = WorkspaceContext::load(workspace_root).await?;
    let supervisor = context.supervisor(agent_kind);
    let result = tickets::step(supervisor, &paths, &mut state, Some(context.config.max_lint_retries)).await?;
    save_ticket_state(&state_path, &state).await?;
    context.shutdown().await;

    match result {
        tickets::StepResult::Continue => println!("continue"),
        tickets::StepResult::Paused(reason) => println!("paused: {reason}"),
        tickets::StepResult::Failed(reason) => {
            println!("failed: {reason}");
            std::process::exit(1);
        }
        tickets::StepResult::Completed(reason) => println!("completed: {reason}"),
    }
    Ok(())
}

async fn load_ticket_state(path: &Path) -> anyhow::Result<TicketFlowState> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TicketFlowState::default()),
        Err(e) => Err(e.into()),
    }
}

async fn save_ticket_state(path: &Path, state: &TicketFlowState) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(state)?;
    conductor_core::lock::atomic_write(path, &bytes).await?;
    Ok(())
}

async fn run_flow(workspace_root: &Path, action: FlowAction) -> anyhow::Result<()> {
    let store = FlowStore::open(&flows_db_path(workspace_root))?;
    match action {
        FlowAction::Start { flow_type, input_json } => {
            let run = store.start_flow(&flow_type, &input_json).await?;
            println!("started flow run {}", run.id);
        }
        FlowAction::Stop { run_id } => {
            store.stop_flow(run_id).await?;
            println!("stopped flow run {run_id}");
        }
        FlowAction::Resume { run_id } => {
            let run = store.resume_flow(run_id).await?;
            println!("resumed flow run {} (status now {})", run.id, describe_status(run.status));
        }
        FlowAction::Status { run_id } => {
            let run = store.get_run(run_id).await?;
            println!(
                "run {} type={} status={} current_step={}",
                run.id,
                run.flow_type,
                describe_status(run.status),
                run.current_step.unwrap_or_else(|| "-".to_string())
            );
        }
        FlowAction::Events { run_id, after_seq } => {
            let events = store.stream_events(run_id, after_seq).await?;
            for event in events {
                println!("[{}] seq={} {} {}", event.timestamp, event.seq, event.event_type, event.data_json);
            }
        }
    }
    Ok(())
}

fn describe_status(status: FlowStatus) -> &'static str {
    match status {
        FlowStatus::Running => "running",
        FlowStatus::Paused => "paused",
        FlowStatus::Stopped => "stopped",
        FlowStatus::Completed => "completed",
        FlowStatus::Failed => "failed",
    }
}

async fn run_snapshot(workspace_root: &Path) -> anyhow::Result<()> {
    let context = WorkspaceContext::load(workspace_root).await?;
    let supervisor = context.supervisor(AgentKind::CodexAppServer);
    let threads_path = workspace_root.join(".conductor").join("threads.json");
    let message = snapshot::generate_snapshot(supervisor, workspace_root, &threads_path).await?;
    println!("{message}");
    context.shutdown().await;
    Ok(())
}

async fn run_doctor(workspace_root: &Path) -> anyhow::Result<()> {
    let config_path = workspace_root.join(".conductor").join("config.yml");
    let config = conductor_core::config::Config::load(&config_path).await?;
    let report = doctor::doctor(workspace_root, &config.agent.program).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}
