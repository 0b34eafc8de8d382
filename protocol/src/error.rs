use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConductorError>;

/// The closed set of error kinds named in the spec's error-handling design.
///
/// Every [`ConductorError`] variant maps to exactly one of these so callers
/// that only care about the *category* (should I retry? should I surface a
/// 409?) don't need to match on the full variant list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Busy,
    Disconnected,
    Timeout,
    Interrupted,
    AgentError,
    PatchRejected,
    Fatal,
}

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("interrupted")]
    Interrupted,

    #[error("agent error: {0}")]
    AgentError(String),

    #[error("patch rejected: {0}")]
    PatchRejected(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ConductorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::Validation(_) => ErrorKind::Validation,
            ConductorError::Busy(_) => ErrorKind::Busy,
            ConductorError::Disconnected(_) => ErrorKind::Disconnected,
            ConductorError::Timeout(_) => ErrorKind::Timeout,
            ConductorError::Interrupted => ErrorKind::Interrupted,
            ConductorError::AgentError(_) => ErrorKind::AgentError,
            ConductorError::PatchRejected(_) => ErrorKind::PatchRejected,
            ConductorError::Fatal(_) => ErrorKind::Fatal,
            ConductorError::Io(_) => ErrorKind::Fatal,
            ConductorError::Json(_) => ErrorKind::Fatal,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ConductorError::Validation(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        ConductorError::Busy(msg.into())
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        ConductorError::Disconnected(msg.into())
    }

    pub fn agent_error(msg: impl Into<String>) -> Self {
        ConductorError::AgentError(msg.into())
    }

    pub fn patch_rejected(msg: impl Into<String>) -> Self {
        ConductorError::PatchRejected(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        ConductorError::Fatal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_named_variants() {
        assert_eq!(ConductorError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(ConductorError::busy("x").kind(), ErrorKind::Busy);
        assert_eq!(ConductorError::Interrupted.kind(), ErrorKind::Interrupted);
    }
}
