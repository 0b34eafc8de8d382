//! Parses `/event` SSE frames from an opencode server into the handful of
//! shapes the turn loop and permission bridge care about. Unrecognized event
//! types are dropped rather than erroring: the server's event vocabulary is
//! wider than what this client consumes.

#[derive(Debug, Clone)]
pub enum OpencodeEvent {
    MessagePartUpdated {
        session_id: String,
        text: Option<String>,
    },
    SessionIdle {
        session_id: String,
    },
    SessionError {
        session_id: String,
        message: String,
    },
    PermissionAsked {
        session_id: String,
        permission_id: String,
        description: Option<String>,
    },
}

impl OpencodeEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            OpencodeEvent::MessagePartUpdated { session_id, .. }
            | OpencodeEvent::SessionIdle { session_id }
            | OpencodeEvent::SessionError { session_id, .. }
            | OpencodeEvent::PermissionAsked { session_id, .. } => Some(session_id.as_str()),
        }
    }
}

pub fn parse_event(data: &str) -> Option<OpencodeEvent> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    let kind = value.get("type")?.as_str()?;
    let properties = value.get("properties").cloned().unwrap_or_default();

    match kind {
        "message.part.updated" => {
            let part = properties.get("part")?;
            let session_id = part.get("sessionID").and_then(|v| v.as_str())?.to_string();
            let text = part
                .get("type")
                .and_then(|v| v.as_str())
                .filter(|t| *t == "text")
                .and_then(|_| part.get("text"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(OpencodeEvent::MessagePartUpdated { session_id, text })
        }
        "session.idle" => {
            let session_id = properties.get("sessionID").and_then(|v| v.as_str())?.to_string();
            Some(OpencodeEvent::SessionIdle { session_id })
        }
        "session.error" => {
            let session_id = properties
                .get("sessionID")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let message = properties
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown opencode session error")
                .to_string();
            Some(OpencodeEvent::SessionError { session_id, message })
        }
        "permission.asked" | "permission.updated" => {
            let session_id = properties.get("sessionID").and_then(|v| v.as_str())?.to_string();
            let permission_id = properties.get("id").and_then(|v| v.as_str())?.to_string();
            let description = properties
                .get("description")
                .or_else(|| properties.get("title"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(OpencodeEvent::PermissionAsked {
                session_id,
                permission_id,
                description,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_part_text() {
        let frame = r#"{"type":"message.part.updated","properties":{"part":{"sessionID":"s1","type":"text","text":"hello"}}}"#;
        match parse_event(frame) {
            Some(OpencodeEvent::MessagePartUpdated { session_id, text }) => {
                assert_eq!(session_id, "s1");
                assert_eq!(text.as_deref(), Some("hello"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_session_idle() {
        let frame = r#"{"type":"session.idle","properties":{"sessionID":"s1"}}"#;
        match parse_event(frame) {
            Some(OpencodeEvent::SessionIdle { session_id }) => assert_eq!(session_id, "s1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_permission_asked() {
        let frame = r#"{"type":"permission.asked","properties":{"sessionID":"s1","id":"perm1","description":"write file"}}"#;
        match parse_event(frame) {
            Some(OpencodeEvent::PermissionAsked {
                session_id,
                permission_id,
                description,
            }) => {
                assert_eq!(session_id, "s1");
                assert_eq!(permission_id, "perm1");
                assert_eq!(description.as_deref(), Some("write file"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ignores_unknown_event_types() {
        let frame = r#"{"type":"lsp.diagnostics","properties":{}}"#;
        assert!(parse_event(frame).is_none());
    }

    #[test]
    fn ignores_malformed_json() {
        assert!(parse_event("not json").is_none());
    }
}
