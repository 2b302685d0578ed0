use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipesyncError, Result};

/// Top-level pipesync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
}

/// Settings injected into the reconciler at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Cluster this instance is responsible for.
    pub cluster_id: String,
    /// Seconds between passes.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Registry whose publish tags get normalized before launch.
    /// No normalization happens when unset.
    #[serde(default)]
    pub default_registry: Option<String>,
    /// Variable the engine substitutes into the appended `:${...}` tag suffix.
    #[serde(default = "default_image_tag_var")]
    pub image_tag_var: String,
    /// Upper bound for each engine call. Unbounded when unset.
    #[serde(default)]
    pub engine_timeout_secs: Option<u64>,
    /// Progress message recorded once while the engine is not ready.
    #[serde(default = "default_initializing_message")]
    pub initializing_message: String,
}

impl ReconcilerConfig {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            interval_secs: default_interval_secs(),
            default_registry: None,
            image_tag_var: default_image_tag_var(),
            engine_timeout_secs: None,
            initializing_message: default_initializing_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (`~` is expanded).
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// External-command execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub precheck_command: String,
    pub launch_command: String,
    pub sync_command: String,
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
}

fn default_interval_secs() -> u64 { 5 }
fn default_image_tag_var() -> String { "CICD_IMAGE_TAG".to_string() }
fn default_initializing_message() -> String {
    "Setting up the pipeline engine. If it is not deployed, this can take a few minutes.".to_string()
}
fn default_store_path() -> String { "~/.pipesync/pipesync.db".to_string() }
fn default_engine_timeout() -> u64 { 120 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PipesyncError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| PipesyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.reconciler.cluster_id.trim().is_empty() {
            return Err(PipesyncError::Config("reconciler.cluster_id must not be empty".into()));
        }
        if self.reconciler.interval_secs == 0 {
            return Err(PipesyncError::Config("reconciler.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Substitute `${VAR}` references from the environment.
///
/// A reference to an unset variable is an engine placeholder and is kept
/// verbatim, as is an unterminated `${`.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&engine_placeholder(name)),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// `${name}`, left for the engine to resolve at build time.
fn engine_placeholder(name: &str) -> String {
    format!("${{{name}}}")
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
