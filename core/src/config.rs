//! Per-workspace `config.yml` loader (SPEC_FULL.md §3.3).
//!
//! Grounded on `original_source/core/config.py`'s `RepoConfig`/`HubConfig`
//! shape, narrowed to only the fields the core actually reads. A missing
//! file falls back to built-in defaults rather than failing, so the core is
//! runnable with zero external config tooling.

use std::collections::HashMap;
use std::path::Path;

use conductor_protocol::ConductorError;
use conductor_protocol::Result;
use serde::Deserialize;
use serde::Serialize;

fn default_turn_timeout_seconds() -> u64 {
    8 * 60 * 60
}

fn default_interrupt_grace_seconds() -> u64 {
    30
}

fn default_autorunner_sleep_seconds() -> u64 {
    5
}

fn default_autorunner_max_wallclock_seconds() -> u64 {
    0
}

fn default_max_handles() -> usize {
    8
}

fn default_idle_ttl_seconds() -> u64 {
    15 * 60
}

fn default_max_lint_retries() -> u32 {
    3
}

fn default_prompt_prev_run_max_chars() -> usize {
    4_000
}

fn default_agent_program() -> String {
    "codex".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["app-server".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub turn_timeout_seconds: u64,
    pub interrupt_grace_seconds: u64,
    pub autorunner_sleep_seconds: u64,
    pub autorunner_max_wallclock_seconds: u64,
    pub autorunner_stop_after_runs: Option<u64>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        TimeoutsConfig {
            turn_timeout_seconds: default_turn_timeout_seconds(),
            interrupt_grace_seconds: default_interrupt_grace_seconds(),
            autorunner_sleep_seconds: default_autorunner_sleep_seconds(),
            autorunner_max_wallclock_seconds: default_autorunner_max_wallclock_seconds(),
            autorunner_stop_after_runs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentBinaryConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for AgentBinaryConfig {
    fn default() -> Self {
        AgentBinaryConfig {
            program: default_agent_program(),
            args: default_agent_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_handles: usize,
    pub idle_ttl_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            max_handles: default_max_handles(),
            idle_ttl_seconds: default_idle_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub prompt_prev_run_max_chars: usize,
    pub prompt_max_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        PromptConfig {
            prompt_prev_run_max_chars: default_prompt_prev_run_max_chars(),
            prompt_max_chars: 12_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub auto_commit: bool,
    pub commit_message_template: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        GitConfig {
            auto_commit: false,
            commit_message_template: "conductor: autorunner run {run_id}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timeouts: TimeoutsConfig,
    pub agent: AgentBinaryConfig,
    pub supervisor: SupervisorConfig,
    pub prompt: PromptConfig,
    pub git: GitConfig,
    pub max_lint_retries: u32,
    /// The five doc-chat kinds' on-disk filenames, overridable.
    pub doc_paths: HashMap<String, String>,
    /// Env var names passed through to the agent subprocess verbatim
    /// (spec.md §6.6 `CAR_*` passthrough).
    pub env_passthrough: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeouts: TimeoutsConfig::default(),
            agent: AgentBinaryConfig::default(),
            supervisor: SupervisorConfig::default(),
            prompt: PromptConfig::default(),
            git: GitConfig::default(),
            max_lint_retries: default_max_lint_retries(),
            doc_paths: HashMap::new(),
            env_passthrough: default_env_passthrough(),
        }
    }
}

fn default_env_passthrough() -> Vec<String> {
    vec![
        "CAR_AGENT_MODEL".to_string(),
        "CAR_AGENT_EFFORT".to_string(),
        "CAR_WORKSPACE_ROOT".to_string(),
    ]
}

impl Config {
    /// Loads `<workspace_root>/.conductor/config.yml`, falling back to
    /// defaults when the file is absent.
    pub async fn load(config_path: &Path) -> Result<Config> {
        match tokio::fs::read_to_string(config_path).await {
            Ok(raw) => serde_yaml::from_str(&raw)
                .map_err(|e| ConductorError::validation(format!("invalid config.yml: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(ConductorError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_config_file_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = Config::load(&dir.path().join("config.yml")).await.expect("load");
        assert_eq!(config.supervisor.max_handles, default_max_handles());
    }

    #[tokio::test]
    async fn partial_config_yml_merges_with_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        tokio::fs::write(&path, "max_lint_retries: 5\n").await.expect("write");
        let config = Config::load(&path).await.expect("load");
        assert_eq!(config.max_lint_retries, 5);
        assert_eq!(config.supervisor.max_handles, default_max_handles());
    }
}
