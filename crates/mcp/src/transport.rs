//! MCP transport layer.
//!
//! Defines the [`Transport`] contract shared by every connection kind and
//! the wire helpers they have in common:
//!
//! - [`sse::SseTransport`]: long-lived event stream plus POSTs to a session endpoint
//! - [`http::StreamableHttpTransport`]: long-lived NDJSON response body plus POSTs
//! - [`stdio::StdioTransport`]: child process speaking NDJSON over its pipes
//! - [`channel::ChannelTransport`]: in-memory pair, for embedding and tests
//!
//! Each implementation embeds a [`PendingTable`](crate::pending::PendingTable)
//! that owns request correlation and connection state.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::McpError;
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

pub mod channel;
pub mod framing;
pub mod http;
pub mod sse;
pub mod stdio;

pub use channel::{ChannelPeer, ChannelTransport};
pub use http::StreamableHttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// One logical connection to one MCP server.
///
/// All methods take `&self` so a transport can be shared behind an `Arc`
/// and used by many concurrent callers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the server this transport talks to.
    fn server_name(&self) -> &str;

    /// Establish the connection. A no-op when already connected; returns
    /// only once `send_request` can be used.
    async fn connect(&self) -> Result<(), McpError>;

    /// Close the connection and reject every in-flight request with
    /// `TransportClosed`. Idempotent and infallible in practice.
    async fn disconnect(&self) -> Result<(), McpError>;

    /// Send `request` and wait for the response carrying the same id.
    ///
    /// A response with an error object is returned as `McpError::RpcError`.
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError>;

    /// Send a one-way message.
    async fn send_notification(&self, notification: JsonRpcNotification)
        -> Result<(), McpError>;

    /// Current connection-state snapshot.
    fn is_connected(&self) -> bool;
}

/// The configurable connection kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Server-sent events subscription with a session endpoint.
    Sse,
    /// Long-lived streaming HTTP response.
    StreamableHttp,
    /// Child process pipes.
    Stdio,
}

impl TransportKind {
    /// Parse a kind as written in configuration files.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sse" | "event-stream" => Some(TransportKind::Sse),
            "http" | "streamable-http" | "streamable_http" | "streamablehttp"
            | "streaming-http" => Some(TransportKind::StreamableHttp),
            "stdio" | "process" => Some(TransportKind::Stdio),
            _ => None,
        }
    }

    /// True for kinds that need an endpoint URL rather than a command.
    pub fn is_remote(self) -> bool {
        !matches!(self, TransportKind::Stdio)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
            TransportKind::Stdio => "stdio",
        })
    }
}

/// Serialize an outbound message as one line of JSON (without the newline).
///
/// `serde_json` escapes control characters, so the output never contains a
/// raw newline and is safe for line framing.
pub(crate) fn encode_frame<T: Serialize>(server: &str, message: &T) -> Result<String, McpError> {
    serde_json::to_string(message)
        .map_err(|e| McpError::send(server, format!("failed to serialize message: {e}")))
}
