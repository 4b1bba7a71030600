use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

/// Top-level Vigil configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Remote analyzer endpoints keyed by capability name.
    #[serde(default)]
    pub analyzers: HashMap<String, AnalyzerEndpointConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to every capability call unless the node overrides it.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Maximum tool-loop iterations per run.
    #[serde(default = "default_max_tool_loops")]
    pub max_tool_loops: usize,
    /// What to do with a second request for a conversation already running.
    #[serde(default)]
    pub lane_policy: LanePolicy,
    /// Broadcast buffer for graph events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: default_node_timeout(),
            max_tool_loops: default_max_tool_loops(),
            lane_policy: LanePolicy::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_node_timeout() -> u64 { 30 }
fn default_max_tool_loops() -> usize { 10 }
fn default_event_capacity() -> usize { 256 }

/// Per-conversation concurrency policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanePolicy {
    /// Wait for the in-flight run, then run (FIFO).
    #[default]
    Queue,
    /// Fail immediately with a busy error.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.vigil/state.db".to_string() }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sqlite,
}

/// A remote analyzer reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerEndpointConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_analyzer_timeout() -> u64 { 30 }

/// Retry configuration for analyzer requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub flag_route: Option<FlagRouteConfig>,
}

/// Backend alert used by the `flag_route` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagRouteConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default = "default_flag_timeout")]
    pub timeout_secs: u64,
}

impl Default for FlagRouteConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            severity: default_severity(),
            timeout_secs: default_flag_timeout(),
        }
    }
}

fn default_backend_url() -> String { "http://localhost:3000".to_string() }
fn default_severity() -> String { "HIGH".to_string() }
fn default_flag_timeout() -> u64 { 5 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| VigilError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| VigilError::Config(e.to_string()))
    }

    /// Resolve the store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let path = &self.store.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
