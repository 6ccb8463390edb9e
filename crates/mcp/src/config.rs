//! Server-list configuration.
//!
//! Accepts the common `{"mcpServers": {...}}` JSON layout or a TOML file
//! with `[servers.<name>]` tables. Entry order is preserved, and it is the
//! order the aggregator reports servers and merges list results in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::McpError;
use crate::transport::TransportKind;

// ── Server entries ──────────────────────────────────────────────────

/// How to reach one server.
///
/// Exactly one of `url` and `command` must be set. `kind` is optional;
/// when absent it is inferred (`command` means stdio, `url` means SSE).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(
        default,
        rename = "type",
        alias = "transport",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Per-request timeout override in milliseconds.
    #[serde(default, alias = "timeout_ms", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ServerConfig {
    /// A child-process server.
    pub fn stdio(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: Some(command.into()),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// A server reached over HTTP at `url`.
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn url(&self) -> Option<&str> {
        self.url.as_deref().filter(|s| !s.trim().is_empty())
    }

    fn command(&self) -> Option<&str> {
        self.command.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Resolve the transport kind for the server called `name`.
    ///
    /// Precedence: explicit kind, then `command` (stdio), then `url` (SSE).
    /// The result is checked against whichever of `url`/`command` is set.
    pub fn resolve_kind(&self, name: &str) -> Result<TransportKind, McpError> {
        let invalid = |reason: &str| McpError::InvalidServerConfig {
            server: name.to_string(),
            reason: reason.to_string(),
        };

        let kind = match self.kind.as_deref() {
            Some(raw) => TransportKind::parse(raw).ok_or_else(|| McpError::UnsupportedTransportKind {
                server: name.to_string(),
                kind: raw.to_string(),
            })?,
            None if self.command().is_some() => TransportKind::Stdio,
            None if self.url().is_some() => TransportKind::Sse,
            None => return Err(invalid("neither `command` nor `url` is set")),
        };

        match (self.url(), self.command()) {
            (Some(_), Some(_)) => Err(invalid("`command` and `url` are mutually exclusive")),
            (None, None) => Err(invalid("neither `command` nor `url` is set")),
            (Some(_), None) if !kind.is_remote() => {
                Err(invalid("transport `stdio` requires `command`, not `url`"))
            }
            (None, Some(_)) if kind.is_remote() => Err(invalid(&format!(
                "transport `{kind}` requires `url`, not `command`"
            ))),
            _ if self.timeout_ms == Some(0) => Err(invalid("`timeoutMs` must be positive")),
            _ => Ok(kind),
        }
    }

    /// Check the entry's invariants without building anything.
    pub fn validate(&self, name: &str) -> Result<(), McpError> {
        self.resolve_kind(name).map(|_| ())
    }

    fn expand_env(&mut self) {
        let expand = |s: &mut String| *s = expand_env_placeholders(s);
        if let Some(url) = self.url.as_mut() {
            expand(url);
        }
        if let Some(command) = self.command.as_mut() {
            expand(command);
        }
        self.args.iter_mut().for_each(expand);
        self.env.values_mut().for_each(expand);
        self.headers.values_mut().for_each(expand);
    }
}

// ── Server list ─────────────────────────────────────────────────────

/// Every configured server, in file order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServersConfig {
    #[serde(default, rename = "mcpServers", alias = "servers")]
    pub servers: IndexMap<String, ServerConfig>,
}

impl ServersConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a server, builder style.
    pub fn with_server(mut self, name: impl Into<String>, config: ServerConfig) -> Self {
        self.servers.insert(name.into(), config);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.servers.iter()
    }

    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self, McpError> {
        let mut config: Self = serde_json::from_str(text)
            .map_err(|e| McpError::Config(format!("invalid JSON config: {e}")))?;
        config.expand_env();
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, McpError> {
        let mut config: Self = toml::from_str(text)
            .map_err(|e| McpError::Config(format!("invalid TOML config: {e}")))?;
        config.expand_env();
        Ok(config)
    }

    /// Load a file; `.toml` files are TOML, anything else is JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, McpError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            Self::from_toml(&content)
        } else {
            Self::from_json(&content)
        };
        parsed.map_err(|e| match e {
            McpError::Config(msg) => McpError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Validate every entry, reporting the first violation.
    pub fn validate(&self) -> Result<(), McpError> {
        for (name, server) in &self.servers {
            server.validate(name)?;
        }
        Ok(())
    }

    fn expand_env(&mut self) {
        self.servers.values_mut().for_each(ServerConfig::expand_env);
    }
}

// ── Sources ─────────────────────────────────────────────────────────

/// Where the aggregator gets its server list from.
///
/// `load` runs on every `Aggregator::connect`, so a file-backed source
/// picks up edits between reconnects.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<ServersConfig, McpError>;
}

impl ConfigSource for ServersConfig {
    fn load(&self) -> Result<ServersConfig, McpError> {
        Ok(self.clone())
    }
}

/// A configuration file on disk.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for ConfigFile {
    fn load(&self) -> Result<ServersConfig, McpError> {
        ServersConfig::from_file(&self.path)
    }
}

// ── Environment placeholders ────────────────────────────────────────

/// Expand `${VAR}` placeholders from the process environment.
/// Unknown variables and unterminated placeholders are left as written.
pub fn expand_env_placeholders(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
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
        match lookup(name) {
            Some(value) if !name.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
