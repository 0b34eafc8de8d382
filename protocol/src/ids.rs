use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Stable hash-derived identifier for a canonicalized workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WorkspaceId {
    /// Derives a stable, filesystem-safe id from a canonicalized path.
    ///
    /// Uses a FNV-1a hash rather than a cryptographic hash: collisions are
    /// tolerable (this is a convenience key, not a security boundary) and
    /// the whole path is also kept alongside it wherever persisted.
    pub fn from_canonical_path(path: &std::path::Path) -> Self {
        let bytes = path.to_string_lossy();
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in bytes.as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        WorkspaceId(format!("{hash:016x}"))
    }
}

/// Agent-assigned opaque conversation/thread id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agent-assigned opaque turn id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stable string key used by the thread registry: `doc_chat.todo`,
/// `spec_ingest`, `autorunner`, `autorunner.opencode`, `snapshot`, etc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureKey(String);

const DOC_CHAT_KINDS: &[&str] = &["todo", "progress", "opinions", "spec", "summary"];

impl FeatureKey {
    /// Normalizes and validates a raw feature key string against the closed
    /// set named in the spec: `doc_chat.{kind}`, `spec_ingest`, `autorunner`,
    /// and `autorunner.<agent-kind>` / `snapshot` sub-agent keys.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let key = raw.trim().to_ascii_lowercase().replace(['/', ':'], ".");
        if key.is_empty() {
            return Err("feature key is required".to_string());
        }
        if let Some(kind) = key.strip_prefix("doc_chat.") {
            if DOC_CHAT_KINDS.contains(&kind) {
                return Ok(FeatureKey(key));
            }
            return Err(format!("invalid feature key: {raw}"));
        }
        match key.as_str() {
            "spec_ingest" | "autorunner" | "autorunner.opencode" | "snapshot" => Ok(FeatureKey(key)),
            _ => Err(format!("invalid feature key: {raw}")),
        }
    }

    pub fn doc_chat(kind: &str) -> Result<Self, String> {
        Self::parse(&format!("doc_chat.{kind}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_case() {
        assert_eq!(FeatureKey::parse("DOC_CHAT/todo").unwrap().as_str(), "doc_chat.todo");
        assert_eq!(FeatureKey::parse("autorunner:opencode").unwrap().as_str(), "autorunner.opencode");
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(FeatureKey::parse("doc_chat.nope").is_err());
        assert!(FeatureKey::parse("bogus").is_err());
        assert!(FeatureKey::parse("").is_err());
    }

    #[test]
    fn workspace_id_is_stable_for_same_path() {
        let p = std::path::Path::new("/tmp/example/repo");
        assert_eq!(
            WorkspaceId::from_canonical_path(p),
            WorkspaceId::from_canonical_path(p)
        );
    }
}
