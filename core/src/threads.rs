//! Feature-key to thread-id map (spec §4.C).
//!
//! A small sibling of [`crate::state`]: same load/atomic-write/lock shape,
//! narrower document. Keys are validated through
//! `conductor_protocol::FeatureKey` so a caller can never persist a thread
//! under a key the rest of the system wouldn't recognize.

use std::collections::HashMap;
use std::path::Path;

use conductor_protocol::ConductorError;
use conductor_protocol::FeatureKey;
use conductor_protocol::Result;
use conductor_protocol::ThreadId;
use serde::Deserialize;
use serde::Serialize;

use crate::lock;
use crate::lock::StateLock;

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMap {
    version: u32,
    threads: HashMap<String, String>,
}

impl Default for ThreadMap {
    fn default() -> Self {
        ThreadMap {
            version: CURRENT_VERSION,
            threads: HashMap::new(),
        }
    }
}

impl ThreadMap {
    pub fn get(&self, key: &FeatureKey) -> Option<ThreadId> {
        self.threads.get(key.as_str()).map(|s| ThreadId(s.clone()))
    }

    pub fn set(&mut self, key: &FeatureKey, thread_id: ThreadId) {
        self.threads.insert(key.as_str().to_string(), thread_id.0);
    }

    pub fn reset(&mut self, key: &FeatureKey) {
        self.threads.remove(key.as_str());
    }

    pub fn feature_map(&self) -> &HashMap<String, String> {
        &self.threads
    }
}

pub async fn load(path: &Path) -> Result<ThreadMap> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let map: ThreadMap = serde_json::from_slice(&bytes).map_err(ConductorError::Json)?;
            Ok(map)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ThreadMap::default()),
        Err(e) => Err(ConductorError::Io(e)),
    }
}

pub async fn save(path: &Path, map: &ThreadMap) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(map).map_err(ConductorError::Json)?;
    lock::atomic_write(path, &bytes).await
}

pub async fn state_lock(path: &Path) -> Result<StateLock> {
    lock::state_lock(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_yields_empty_current_version() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("threads.json");
        let map = load(&path).await.expect("load");
        assert_eq!(map.version, CURRENT_VERSION);
        assert!(map.feature_map().is_empty());
    }

    #[tokio::test]
    async fn set_get_reset_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("threads.json");
        let key = FeatureKey::doc_chat("todo").expect("valid key");
        let mut map = ThreadMap::default();
        map.set(&key, ThreadId("thread-1".to_string()));
        save(&path, &map).await.expect("save");

        let reloaded = load(&path).await.expect("reload");
        assert_eq!(reloaded.get(&key).map(|t| t.0), Some("thread-1".to_string()));

        let mut reloaded = reloaded;
        reloaded.reset(&key);
        assert!(reloaded.get(&key).is_none());
    }
}
