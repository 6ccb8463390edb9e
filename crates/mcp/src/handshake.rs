//! MCP session initialization.

use tracing::info;

use crate::codec::MessageCodec;
use crate::error::McpError;
use crate::transport::Transport;
use crate::types::{
    methods, ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, PROTOCOL_VERSION,
};

pub const CLIENT_NAME: &str = "mcphub";

/// Send `initialize`, then `notifications/initialized`.
///
/// Any failure is reported as a `ConnectionError` for the transport's
/// server, since the session is unusable without it.
pub async fn initialize(
    transport: &dyn Transport,
    codec: &MessageCodec,
) -> Result<InitializeResult, McpError> {
    let server = transport.server_name();
    let params = InitializeParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: ClientInfo {
            name: CLIENT_NAME.to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        },
    };
    let params = serde_json::to_value(params)
        .map_err(|e| McpError::connection(server, format!("initialize params: {e}")))?;

    let response = transport
        .send_request(codec.build_request(methods::INITIALIZE, Some(params)))
        .await
        .map_err(|e| McpError::connection(server, format!("initialize failed: {e}")))?;

    // Servers that return an empty or unexpected result are still usable.
    let result: InitializeResult =
        serde_json::from_value(response.result_or_null().clone()).unwrap_or_default();

    transport
        .send_notification(codec.build_notification(methods::INITIALIZED, None))
        .await
        .map_err(|e| McpError::connection(server, format!("initialized notification failed: {e}")))?;

    info!(
        server = %server,
        protocol = result.protocol_version.as_deref().unwrap_or("unknown"),
        server_name = result.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
        "MCP session initialized"
    );
    Ok(result)
}
