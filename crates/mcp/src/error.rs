//! Error types for the MCP crate.

use std::time::Duration;

use serde_json::Value;

use crate::types::JsonRpcError;

/// Errors that can occur while configuring, connecting to, or talking to
/// MCP servers.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// A server entry violates the configuration invariants.
    #[error("invalid config for server '{server}': {reason}")]
    InvalidServerConfig { server: String, reason: String },

    /// An explicit transport kind names none of the supported variants.
    #[error("server '{server}' uses unsupported transport kind '{kind}'")]
    UnsupportedTransportKind { server: String, kind: String },

    /// The loaded configuration contains no servers.
    #[error("no MCP servers configured")]
    NoServersConfigured,

    /// A single transport failed to connect.
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectionError { server: String, reason: String },

    /// One or more servers failed during `Aggregator::connect`.
    #[error("{} server(s) failed to connect: {}", .failures.len(), summarize(.failures))]
    ConnectFailed { failures: Vec<(String, McpError)> },

    /// No response arrived before the request deadline.
    #[error("request '{method}' to server '{server}' timed out after {timeout:?}")]
    Timeout {
        server: String,
        method: String,
        timeout: Duration,
    },

    /// The transport is not connected, or was closed while the request was in flight.
    #[error("transport for server '{server}' is closed")]
    TransportClosed { server: String },

    /// The framed message could not be delivered.
    #[error("failed to send to server '{server}': {reason}")]
    SendError { server: String, reason: String },

    /// The server answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    RpcError {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// An `RpcError` surfaced through one of the aggregator's call operations.
    #[error("{method} on server '{server}' failed [{code}]: {message}")]
    CallFailed {
        server: String,
        method: String,
        code: i64,
        message: String,
    },

    /// An inbound payload is not a valid JSON-RPC response.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The aggregator has no connection registered under this name.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// The configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// The configuration file could not be read.
    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl McpError {
    /// True for request deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// True when the owning transport is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, McpError::TransportClosed { .. })
    }

    pub(crate) fn closed(server: &str) -> Self {
        McpError::TransportClosed {
            server: server.to_string(),
        }
    }

    pub(crate) fn send(server: &str, reason: impl std::fmt::Display) -> Self {
        McpError::SendError {
            server: server.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn connection(server: &str, reason: impl std::fmt::Display) -> Self {
        McpError::ConnectionError {
            server: server.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        McpError::RpcError {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

fn summarize(failures: &[(String, McpError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
