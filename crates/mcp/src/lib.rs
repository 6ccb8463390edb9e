//! Multi-server MCP (Model Context Protocol) client.
//!
//! Connects to many JSON-RPC 2.0 servers at once, each over its own
//! transport, and presents their tools, resources and prompts as one
//! surface.
//!
//! # Architecture
//!
//! - **types**: JSON-RPC 2.0 envelopes and MCP payload types
//! - **codec**: request id allocation and response validation
//! - **pending**: per-transport request/response correlation
//! - **transport**: the `Transport` trait plus SSE, streaming HTTP, stdio and in-memory variants
//! - **config**: server list loading (JSON or TOML)
//! - **factory**: server entry to transport
//! - **aggregator**: parallel connect and fan-out listing
//! - **error**: unified error type
//!
//! # Usage
//!
//! ```no_run
//! use mcphub::{Aggregator, ConfigFile};
//!
//! # async fn example() -> Result<(), mcphub::McpError> {
//! let hub = Aggregator::new(ConfigFile::new("mcp_servers.json"));
//! hub.connect().await?;
//! for tool in hub.list_tools().await {
//!     println!("{} ({})", tool.item.name, tool.server_name);
//! }
//! let result = hub
//!     .call_tool("files", "read_file", serde_json::json!({"path": "README.md"}))
//!     .await?;
//! println!("{:?}", result.content);
//! hub.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod codec;
pub mod config;
pub mod error;
pub mod factory;
pub mod handshake;
pub mod pending;
pub mod transport;
pub mod types;

pub use aggregator::{Aggregator, AggregatorOptions};
pub use codec::MessageCodec;
pub use config::{ConfigFile, ConfigSource, ServerConfig, ServersConfig};
pub use error::McpError;
pub use factory::{create_transport, DefaultTransportFactory, TransportFactory};
pub use pending::{ConnectionState, PendingTable, DEFAULT_REQUEST_TIMEOUT};
pub use transport::{
    ChannelPeer, ChannelTransport, SseTransport, StdioTransport, StreamableHttpTransport,
    Transport, TransportKind,
};
pub use types::*;
