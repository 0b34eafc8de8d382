//! JSON-RPC-over-stdio implementation of [`AgentClient`] (spec §4.D1).
//!
//! Grounded on the teacher's `mcp-server::outgoing_message` correlation
//! pattern (atomic id counter keyed `oneshot` map) and `mcp-server::main`'s
//! stdin/stdout task split, mirrored here for the client role: we spawn the
//! subprocess, write requests to its stdin, and read its stdout line by line
//! on a dedicated task.

mod wire;

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_protocol::ApprovalPolicy;
use conductor_protocol::ConductorError;
use conductor_protocol::Result;
use conductor_protocol::SandboxPolicy;
use conductor_protocol::ThreadId;
use conductor_protocol::TurnId;
use conductor_protocol::TurnResult;
use conductor_protocol::TurnStatus;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::ApprovalHandler;
use crate::NotificationHandler;
use crate::StartedThread;
use crate::ThreadListPage;
use crate::TurnHandle;
use crate::TurnInput;
use wire::parse_incoming_line;
use wire::IncomingLine;
use wire::JsonRpcErrorObj;
use wire::OutgoingRequest;
use wire::OutgoingResponse;
use wire::RequestId;
use wire::ResponseOutcome;

/// Notifications larger than this are dropped rather than forwarded, with a
/// warning and a bump of [`AppServerClient::dropped_notifications`]. Guards
/// against a misbehaving agent flooding the orchestrator with, say, an
/// entire file's contents inlined into a progress notification.
const MAX_NOTIFICATION_BYTES: usize = 1_000_000;

type PendingMap = Mutex<HashMap<i64, oneshot::Sender<std::result::Result<Value, JsonRpcErrorObj>>>>;
type TurnSinkMap = Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>;

pub struct AppServerClient {
    outgoing: mpsc::UnboundedSender<String>,
    child: Mutex<Option<Child>>,
    next_id: AtomicI64,
    pending: Arc<PendingMap>,
    turn_sinks: Arc<TurnSinkMap>,
    notification_handler: Arc<dyn NotificationHandler>,
    approval_handler: Arc<dyn ApprovalHandler>,
    request_timeout: Duration,
    disconnected: Arc<AtomicBool>,
    dropped_notifications: Arc<AtomicU64>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl AppServerClient {
    pub async fn spawn(
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &HashMap<String, String>,
        notification_handler: Arc<dyn NotificationHandler>,
        approval_handler: Arc<dyn ApprovalHandler>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(ConductorError::Io)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConductorError::fatal("app-server child has no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConductorError::fatal("app-server child has no stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ConductorError::fatal("app-server child has no stderr pipe"))?;

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let turn_sinks: Arc<TurnSinkMap> = Arc::new(Mutex::new(HashMap::new()));
        let disconnected = Arc::new(AtomicBool::new(false));
        let dropped_notifications = Arc::new(AtomicU64::new(0));

        tokio::spawn(drain_stderr(stderr));

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(stdin, outgoing_rx));

        let reader_task = tokio::spawn(read_loop(
            stdout,
            pending.clone(),
            turn_sinks.clone(),
            disconnected.clone(),
            dropped_notifications.clone(),
            notification_handler.clone(),
            approval_handler.clone(),
            outgoing_tx.clone(),
        ));

        Ok(Self {
            outgoing: outgoing_tx,
            child: Mutex::new(Some(child)),
            next_id: AtomicI64::new(1),
            pending,
            turn_sinks,
            notification_handler,
            approval_handler,
            request_timeout,
            disconnected,
            dropped_notifications,
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
        })
    }

    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.disconnected.load(Ordering::Relaxed) {
            return Err(ConductorError::disconnected(format!(
                "app-server process is gone, cannot send {method}"
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = OutgoingRequest {
            jsonrpc: wire::JSONRPC_VERSION,
            id: RequestId::Integer(id),
            method,
            params,
        };
        let line = serde_json::to_string(&request).map_err(ConductorError::Json)?;

        if self.outgoing.send(line).is_err() {
            self.pending.lock().await.remove(&id);
            self.disconnected.store(true, Ordering::Relaxed);
            return Err(ConductorError::disconnected(format!(
                "app-server writer task is gone, cannot send {method}"
            )));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(ConductorError::agent_error(format!(
                "{method} failed: {} (code {})",
                err.message, err.code
            ))),
            Ok(Err(_recv_error)) => {
                self.disconnected.store(true, Ordering::Relaxed);
                Err(ConductorError::disconnected(format!(
                    "app-server closed before replying to {method}"
                )))
            }
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                Err(crate::timeout_err(method, self.request_timeout))
            }
        }
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "app_server_stderr", "{line}");
    }
}

/// Owns the child's stdin and is the only task allowed to write to it, so
/// `AppServerClient::call` and approval replies from [`read_loop`] never
/// race each other for the pipe.
async fn write_loop(mut stdin: ChildStdin, mut outgoing: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = outgoing.recv().await {
        line.push('\n');
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    stdout: tokio::process::ChildStdout,
    pending: Arc<PendingMap>,
    turn_sinks: Arc<TurnSinkMap>,
    disconnected: Arc<AtomicBool>,
    dropped_notifications: Arc<AtomicU64>,
    notification_handler: Arc<dyn NotificationHandler>,
    approval_handler: Arc<dyn ApprovalHandler>,
    outgoing: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("app-server stdout read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_incoming_line(&line) {
            IncomingLine::Response { id, outcome } => {
                let RequestId::Integer(id) = id else {
                    warn!("app-server replied with a non-integer id, dropping");
                    continue;
                };
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(outcome);
                }
            }
            IncomingLine::Notification { method, params } => {
                let size = params.as_ref().map(|p| p.to_string().len()).unwrap_or(0);
                if size > MAX_NOTIFICATION_BYTES {
                    dropped_notifications.fetch_add(1, Ordering::Relaxed);
                    warn!("dropping oversized notification {method} ({size} bytes)");
                    continue;
                }
                if let Some(turn_id) = params
                    .as_ref()
                    .and_then(|p| p.get("turnId").or_else(|| p.get("turn_id")))
                    .and_then(|v| v.as_str())
                {
                    if let Some(sink) = turn_sinks.lock().await.get(turn_id) {
                        let payload = json!({"method": method, "params": params});
                        let _ = sink.send(payload);
                    }
                }
                notification_handler.handle_notification(&method, params).await;
            }
            IncomingLine::ServerRequest { id, method, params } => {
                let decision = approval_handler.handle_approval(&method, params).await;
                let outcome = ResponseOutcome::Result {
                    result: json!({ "decision": decision }),
                };
                let response = OutgoingResponse {
                    jsonrpc: wire::JSONRPC_VERSION,
                    id,
                    outcome,
                };
                match serde_json::to_string(&response) {
                    Ok(line) => {
                        let _ = outgoing.send(line);
                    }
                    Err(e) => warn!("failed to encode approval response for {method}: {e}"),
                }
            }
        }
    }

    disconnected.store(true, Ordering::Relaxed);
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(JsonRpcErrorObj {
            code: -32001,
            message: "app-server process exited".to_string(),
            data: None,
        }));
    }
}

fn extract_thread_id(value: &Value) -> Result<ThreadId> {
    let raw = value
        .get("id")
        .or_else(|| value.get("threadId"))
        .or_else(|| value.get("thread_id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ConductorError::agent_error("thread response missing an id field"))?;
    Ok(ThreadId(raw.to_string()))
}

fn extract_turn_id(value: &Value) -> Result<TurnId> {
    let raw = value
        .get("id")
        .or_else(|| value.get("turnId"))
        .or_else(|| value.get("turn_id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ConductorError::agent_error("turn response missing an id field"))?;
    Ok(TurnId(raw.to_string()))
}

fn extract_thread_ids(value: &Value) -> Vec<ThreadId> {
    let list = value
        .get("threads")
        .or_else(|| value.get("data"))
        .cloned()
        .unwrap_or_else(|| value.clone());
    let Some(array) = list.as_array() else {
        return Vec::new();
    };
    array
        .iter()
        .filter_map(|item| {
            if let Some(s) = item.as_str() {
                Some(ThreadId(s.to_string()))
            } else {
                item.get("id")
                    .or_else(|| item.get("threadId"))
                    .and_then(|v| v.as_str())
                    .map(|s| ThreadId(s.to_string()))
            }
        })
        .collect()
}

#[async_trait]
impl crate::AgentClient for AppServerClient {
    async fn thread_start(
        &self,
        cwd: &Path,
        approval_policy: ApprovalPolicy,
        sandbox: SandboxPolicy,
    ) -> Result<StartedThread> {
        let params = json!({
            "cwd": cwd.to_string_lossy(),
            "approvalPolicy": approval_policy.as_wire_str(),
            "sandboxPolicy": sandbox.as_wire_str(),
        });
        let result = self.call("thread/start", Some(params)).await?;
        let thread_id = extract_thread_id(&result)?;
        let cwd = result
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(StartedThread { thread_id, cwd })
    }

    async fn thread_resume(&self, thread_id: &ThreadId) -> Result<StartedThread> {
        let params = json!({ "threadId": thread_id.0 });
        let result = self.call("thread/resume", Some(params)).await?;
        let resumed_id = extract_thread_id(&result).unwrap_or_else(|_| thread_id.clone());
        let cwd = result
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(StartedThread {
            thread_id: resumed_id,
            cwd,
        })
    }

    async fn thread_list(
        &self,
        cwd: Option<&Path>,
        cursor: Option<&str>,
    ) -> Result<ThreadListPage> {
        let mut params = serde_json::Map::new();
        if let Some(cwd) = cwd {
            params.insert("cwd".to_string(), json!(cwd.to_string_lossy()));
        }
        if let Some(cursor) = cursor {
            params.insert("cursor".to_string(), json!(cursor));
        }
        let result = self
            .call("thread/list", Some(Value::Object(params)))
            .await?;
        let thread_ids = extract_thread_ids(&result);
        let next_cursor = result
            .get("nextCursor")
            .or_else(|| result.get("next_cursor"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(ThreadListPage {
            thread_ids,
            next_cursor,
        })
    }

    async fn turn_start(
        &self,
        thread_id: &ThreadId,
        input: TurnInput,
        approval_policy: ApprovalPolicy,
        sandbox: SandboxPolicy,
        model: Option<&str>,
        effort: Option<&str>,
    ) -> Result<Box<dyn TurnHandle>> {
        let input_value = match input {
            TurnInput::Text(text) => json!([{ "type": "text", "text": text }]),
            TurnInput::Items(items) => Value::Array(items),
        };
        let mut params = serde_json::Map::new();
        params.insert("threadId".to_string(), json!(thread_id.0));
        params.insert("input".to_string(), input_value);
        params.insert(
            "approvalPolicy".to_string(),
            json!(approval_policy.as_wire_str()),
        );
        params.insert("sandboxPolicy".to_string(), json!(sandbox.as_wire_str()));
        if let Some(model) = model {
            params.insert("model".to_string(), json!(model));
        }
        if let Some(effort) = effort {
            params.insert("effort".to_string(), json!(effort));
        }

        let result = self
            .call("turn/start", Some(Value::Object(params)))
            .await?;
        let turn_id = extract_turn_id(&result)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.turn_sinks
            .lock()
            .await
            .insert(turn_id.0.clone(), tx);

        Ok(Box::new(AppServerTurnHandle {
            thread_id: thread_id.clone(),
            turn_id,
            events: rx,
            turn_sinks: self.turn_sinks.clone(),
            disconnected: self.disconnected.clone(),
        }))
    }

    async fn turn_interrupt(&self, turn_id: &TurnId, thread_id: &ThreadId) -> Result<()> {
        let params = json!({ "turnId": turn_id.0, "threadId": thread_id.0 });
        self.call("turn/interrupt", Some(params)).await?;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.disconnected.load(Ordering::Relaxed)
    }

    async fn shutdown(&self) {
        drop(self.outgoing.clone());
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.lock().await.take() {
            task.abort();
        }
        self.disconnected.store(true, Ordering::Relaxed);
    }
}

struct AppServerTurnHandle {
    thread_id: ThreadId,
    turn_id: TurnId,
    events: mpsc::UnboundedReceiver<Value>,
    turn_sinks: Arc<TurnSinkMap>,
    disconnected: Arc<AtomicBool>,
}

impl Drop for AppServerTurnHandle {
    fn drop(&mut self) {
        let sinks = self.turn_sinks.clone();
        let key = self.turn_id.0.clone();
        tokio::spawn(async move {
            sinks.lock().await.remove(&key);
        });
    }
}

#[async_trait]
impl TurnHandle for AppServerTurnHandle {
    fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<TurnResult> {
        let mut agent_messages = Vec::new();
        let mut errors = Vec::new();

        let collect = async {
            loop {
                match self.events.recv().await {
                    Some(event) => {
                        let method = event.get("method").and_then(|v| v.as_str()).unwrap_or("");
                        let params = event.get("params").cloned().unwrap_or(Value::Null);
                        match method {
                            "turn/completed" | "turn/failed" | "turn/interrupted" => {
                                let status = match method {
                                    "turn/completed" => TurnStatus::Completed,
                                    "turn/interrupted" => TurnStatus::Interrupted,
                                    _ => TurnStatus::Failed,
                                };
                                if let Some(err) = params.get("error").and_then(|v| v.as_str()) {
                                    errors.push(err.to_string());
                                }
                                return status;
                            }
                            "item/agentMessage" | "item/message" => {
                                if let Some(text) = params.get("text").and_then(|v| v.as_str()) {
                                    agent_messages.push(text.to_string());
                                }
                            }
                            "item/error" => {
                                if let Some(msg) = params.get("message").and_then(|v| v.as_str()) {
                                    errors.push(msg.to_string());
                                }
                            }
                            _ => {}
                        }
                    }
                    None => return TurnStatus::Failed,
                }
            }
        };

        let status = match timeout {
            Some(dur) => match tokio::time::timeout(dur, collect).await {
                Ok(status) => status,
                Err(_) => TurnStatus::TimedOut,
            },
            None => collect.await,
        };

        if self.disconnected.load(Ordering::Relaxed) && errors.is_empty() && agent_messages.is_empty()
        {
            return Err(ConductorError::disconnected(
                "app-server process exited before the turn finished",
            ));
        }

        Ok(TurnResult {
            turn_id: self.turn_id.clone(),
            thread_id: self.thread_id.clone(),
            status,
            agent_messages,
            errors,
            token_usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingNotifications {
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl NotificationHandler for RecordingNotifications {
        async fn handle_notification(&self, method: &str, _params: Option<Value>) {
            self.seen.lock().unwrap().push(method.to_string());
        }
    }

    #[test]
    fn extract_thread_id_accepts_either_key() {
        assert_eq!(
            extract_thread_id(&json!({"threadId": "abc"})).unwrap(),
            ThreadId("abc".to_string())
        );
        assert_eq!(
            extract_thread_id(&json!({"id": "xyz"})).unwrap(),
            ThreadId("xyz".to_string())
        );
        assert!(extract_thread_id(&json!({})).is_err());
    }

    #[test]
    fn extract_thread_ids_handles_wrapped_and_bare_shapes() {
        let wrapped = json!({"threads": [{"id": "a"}, {"threadId": "b"}]});
        assert_eq!(extract_thread_ids(&wrapped).len(), 2);

        let bare = json!(["a", "b", "c"]);
        assert_eq!(extract_thread_ids(&bare).len(), 3);

        let data_wrapped = json!({"data": ["only-one"]});
        assert_eq!(extract_thread_ids(&data_wrapped).len(), 1);
    }

    #[tokio::test]
    async fn spawn_rejects_missing_program() {
        let err = AppServerClient::spawn(
            "/nonexistent/definitely-not-a-binary",
            &[],
            std::path::Path::new("."),
            &HashMap::new(),
            Arc::new(RecordingNotifications {
                seen: Arc::new(StdMutex::new(Vec::new())),
            }),
            Arc::new(crate::AlwaysDecline),
            Duration::from_secs(5),
        )
        .await;
        assert!(err.is_err());
    }
}
