//! Line-delimited JSON-RPC envelope types for the app-server wire protocol
//! (spec §4.D1). Grounded on the teacher's `mcp-server::outgoing_message`
//! request/response correlation pattern and `mcp-server::main`'s stdin/stdout
//! line-reader loop, adapted here for the *client* side: we are the one
//! spawning the child and issuing requests, not answering them.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Integer(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OutgoingRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct OutgoingResponse {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResponseOutcome {
    Result { result: Value },
    Error { error: JsonRpcErrorObj },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObj {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// The three inbound shapes a line can deserialize into, discriminated on
/// the presence of `id` / `method` exactly as spec §4.D1 describes: a
/// response has `id` and `result`/`error`; a notification has `method` and
/// no `id`; a server-initiated request has both `id` and `method`.
#[derive(Debug)]
pub enum IncomingLine {
    Response {
        id: RequestId,
        outcome: std::result::Result<Value, JsonRpcErrorObj>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    ServerRequest {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Malformed(String),
}

pub fn parse_incoming_line(line: &str) -> IncomingLine {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return IncomingLine::Malformed(format!("invalid JSON: {e}")),
    };
    let obj = match value.as_object() {
        Some(o) => o,
        None => return IncomingLine::Malformed("top-level value is not an object".to_string()),
    };
    let id: Option<RequestId> = obj.get("id").and_then(|v| serde_json::from_value(v.clone()).ok());
    let method = obj.get("method").and_then(|v| v.as_str()).map(str::to_string);
    let params = obj.get("params").cloned();

    match (id, method) {
        (Some(id), Some(method)) => IncomingLine::ServerRequest { id, method, params },
        (None, Some(method)) => IncomingLine::Notification { method, params },
        (Some(id), None) => {
            if let Some(err) = obj.get("error") {
                match serde_json::from_value::<JsonRpcErrorObj>(err.clone()) {
                    Ok(err) => IncomingLine::Response { id, outcome: Err(err) },
                    Err(e) => IncomingLine::Malformed(format!("invalid error object: {e}")),
                }
            } else {
                let result = obj.get("result").cloned().unwrap_or(Value::Null);
                IncomingLine::Response { id, outcome: Ok(result) }
            }
        }
        (None, None) => IncomingLine::Malformed("neither id nor method present".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_response() {
        let line = r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#;
        match parse_incoming_line(line) {
            IncomingLine::Response { id, outcome } => {
                assert_eq!(id, RequestId::Integer(3));
                assert!(outcome.is_ok());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_notification() {
        let line = r#"{"jsonrpc":"2.0","method":"turn/completed","params":{"turnId":"t1"}}"#;
        match parse_incoming_line(line) {
            IncomingLine::Notification { method, .. } => assert_eq!(method, "turn/completed"),
            other => panic!("expected Notification, got {other:?}"),
        }
    }

    #[test]
    fn classifies_server_request() {
        let line = r#"{"jsonrpc":"2.0","id":"a1","method":"item/fileChange/requestApproval","params":{}}"#;
        match parse_incoming_line(line) {
            IncomingLine::ServerRequest { id, method, .. } => {
                assert_eq!(id, RequestId::String("a1".to_string()));
                assert_eq!(method, "item/fileChange/requestApproval");
            }
            other => panic!("expected ServerRequest, got {other:?}"),
        }
    }

    #[test]
    fn classifies_error_response() {
        let line = r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32000,"message":"no such thread"}}"#;
        match parse_incoming_line(line) {
            IncomingLine::Response { outcome, .. } => {
                let err = outcome.unwrap_err();
                assert_eq!(err.message, "no such thread");
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }
}
