//! Server Configuration
//!
//! Everything comes from the environment (after `.env` is loaded). Tool
//! sources are read from the JSON file named by `TOOL_SOURCES_FILE`:
//!
//! ```json
//! {
//!   "sources": [
//!     {"name": "fetch", "command": "uvx", "args": ["mcp-server-fetch"], "enable_env": "MCP_FETCH"},
//!     {"name": "lights", "url": "http://localhost:8123/mcp", "allowed_tools": ["turn_on", "turn_off"]}
//!   ]
//! }
//! ```
//!
//! Without a file, the built-in `fetch` source is used, enabled by `MCP_FETCH`.

use std::str::FromStr;
use std::time::Duration;

use agent_core::ExternalChannelConfig;
use anyhow::{bail, Context};
use serde::Deserialize;

/// Which model backend to drive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Ollama,
    OpenAi,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "openai" => Ok(ProviderKind::OpenAi),
            other => bail!("unknown PROVIDER '{}' (expected 'ollama' or 'openai')", other),
        }
    }
}

/// Host process configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub provider: ProviderKind,

    /// Overrides the provider's default model
    pub model: Option<String>,

    pub max_turns: usize,
    pub tool_timeout: Option<Duration>,
    pub tool_retries: u32,
    pub bind_addr: String,

    /// Configured tool sources, disabled ones included
    pub sources: Vec<ExternalChannelConfig>,

    /// Only register these sources (`None` = all enabled)
    pub source_filter: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    /// Environment flag that switches the source on
    #[serde(default)]
    enable_env: Option<String>,

    #[serde(flatten)]
    channel: ExternalChannelConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let provider = lookup("PROVIDER")
            .map(|p| p.parse())
            .transpose()?
            .unwrap_or(ProviderKind::Ollama);

        let max_turns = parse_or(&lookup, "MAX_TURNS", 10)?;
        if max_turns == 0 {
            bail!("MAX_TURNS must be at least 1");
        }
        let tool_timeout = match parse_or(&lookup, "TOOL_TIMEOUT_SECS", 60u64)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let sources = match lookup("TOOL_SOURCES_FILE") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading tool sources from {}", path))?;
                parse_sources(&raw, &lookup).with_context(|| format!("parsing {}", path))?
            }
            None => default_sources(&lookup),
        };

        let source_filter = lookup("TOOL_SOURCES").map(|names| {
            names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect()
        });

        Ok(Self {
            provider,
            model: lookup("MODEL").filter(|m| !m.trim().is_empty()),
            max_turns,
            tool_timeout,
            tool_retries: parse_or(&lookup, "TOOL_RETRIES", 0)?,
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".into()),
            sources,
            source_filter,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

fn flag_set(value: Option<String>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
}

fn parse_sources(raw: &str, lookup: &impl Fn(&str) -> Option<String>) -> anyhow::Result<Vec<ExternalChannelConfig>> {
    let file: SourcesFile = serde_json::from_str(raw)?;
    Ok(file
        .sources
        .into_iter()
        .map(|entry| {
            let mut channel = entry.channel;
            if let Some(var) = entry.enable_env {
                channel.enabled = channel.enabled && flag_set(lookup(&var));
            }
            channel
        })
        .collect())
}

fn default_sources(lookup: &impl Fn(&str) -> Option<String>) -> Vec<ExternalChannelConfig> {
    let mut fetch = ExternalChannelConfig::command("fetch", "uvx", vec!["mcp-server-fetch".into()]);
    fetch.enabled = flag_set(lookup("MCP_FETCH"));
    vec![fetch]
}
