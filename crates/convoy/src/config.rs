//! Application configuration.
//!
//! Loaded from a TOML file layered with `CONVOY__`-prefixed environment
//! variables. Every section has sensible defaults so a bare `convoy serve`
//! works out of the box with directories under the current working directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub assistant: AssistantConfig,
}

/// HTTP/WebSocket server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Filesystem layout settings. All paths support `~` and `$VAR` expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root directory containing source repositories available for cloning.
    pub repositories_dir: String,
    /// Root directory where cloned projects are materialized.
    pub projects_dir: String,
    /// Staging directory for speculative hot copies.
    pub hot_copies_dir: String,
    /// Directory holding conversation files and the session table.
    pub data_dir: String,
    /// Root against which conversation working directories are resolved.
    pub project_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            repositories_dir: "./repositories".to_string(),
            projects_dir: "./projects".to_string(),
            hot_copies_dir: "./hot-copies".to_string(),
            data_dir: "./data".to_string(),
            project_root: ".".to_string(),
        }
    }
}

impl PathsConfig {
    /// Expand and resolve all configured paths.
    pub fn resolve(&self) -> Result<ResolvedPaths> {
        Ok(ResolvedPaths {
            repositories_dir: expand_path(&self.repositories_dir)?,
            projects_dir: expand_path(&self.projects_dir)?,
            hot_copies_dir: expand_path(&self.hot_copies_dir)?,
            data_dir: expand_path(&self.data_dir)?,
            project_root: expand_path(&self.project_root)?,
        })
    }
}

/// Fully expanded filesystem layout.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub repositories_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub hot_copies_dir: PathBuf,
    pub data_dir: PathBuf,
    pub project_root: PathBuf,
}

/// External assistant subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Executable name or path for the assistant CLI.
    pub binary: String,
    /// Capability allow-list passed to the assistant.
    pub allowed_tools: Vec<String>,
    /// Optional text appended to the assistant's system prompt.
    pub append_system_prompt: Option<String>,
    /// Milliseconds to wait after a graceful stop before force-killing.
    pub stop_grace_ms: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            allowed_tools: [
                "LS", "Read", "Write", "Edit", "Bash", "Grep", "Glob", "WebSearch", "WebFetch",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            append_system_prompt: None,
            stop_grace_ms: 3000,
        }
    }
}

fn expand_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).with_context(|| format!("expanding path {text:?}"))?;
    Ok(PathBuf::from(expanded.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.assistant.binary, "claude");
        assert!(cfg.assistant.allowed_tools.contains(&"Bash".to_string()));
        assert!(cfg.assistant.append_system_prompt.is_none());
    }

    #[test]
    fn paths_resolve_without_expansion_vars() {
        let paths = PathsConfig::default().resolve().unwrap();
        assert_eq!(paths.hot_copies_dir, PathBuf::from("./hot-copies"));
    }

    #[test]
    fn toml_roundtrip_preserves_sections() {
        let cfg = AppConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.host, cfg.server.host);
        assert_eq!(parsed.paths.data_dir, cfg.paths.data_dir);
    }
}
