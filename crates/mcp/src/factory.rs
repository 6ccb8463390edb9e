//! Builds one transport per configured server.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::codec::MessageCodec;
use crate::config::ServerConfig;
use crate::error::McpError;
use crate::transport::stdio::ProcessSpec;
use crate::transport::{
    SseTransport, StdioTransport, StreamableHttpTransport, Transport, TransportKind,
};

/// Turns a server entry into an unconnected transport.
///
/// The aggregator goes through this trait so embedders and tests can
/// substitute their own transports.
pub trait TransportFactory: Send + Sync {
    fn create(&self, name: &str, config: &ServerConfig) -> Result<Arc<dyn Transport>, McpError>;
}

/// Builds the real SSE, streaming-HTTP and stdio transports.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    codec: Arc<MessageCodec>,
    default_timeout: Duration,
}

impl DefaultTransportFactory {
    /// `codec` is shared by every transport so ids stay process-unique.
    pub fn new(codec: Arc<MessageCodec>, default_timeout: Duration) -> Self {
        Self {
            codec,
            default_timeout,
        }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, name: &str, config: &ServerConfig) -> Result<Arc<dyn Transport>, McpError> {
        create_transport(name, config, Arc::clone(&self.codec), self.default_timeout)
    }
}

/// Build the transport for `config`.
///
/// The kind is the explicit one if given, else stdio when a command is
/// set, else SSE when a URL is set. `config.timeout_ms` overrides
/// `default_timeout`.
pub fn create_transport(
    name: &str,
    config: &ServerConfig,
    codec: Arc<MessageCodec>,
    default_timeout: Duration,
) -> Result<Arc<dyn Transport>, McpError> {
    let kind = config.resolve_kind(name)?;
    let timeout = config.timeout().unwrap_or(default_timeout);
    debug!(server = %name, %kind, ?timeout, "creating transport");

    let url = config.url.as_deref().unwrap_or_default();
    let transport: Arc<dyn Transport> = match kind {
        TransportKind::Sse => Arc::new(SseTransport::new(
            name,
            url,
            &config.headers,
            codec,
            timeout,
        )?),
        TransportKind::StreamableHttp => Arc::new(StreamableHttpTransport::new(
            name,
            url,
            &config.headers,
            codec,
            timeout,
        )?),
        TransportKind::Stdio => {
            let process = ProcessSpec {
                command: config.command.clone().unwrap_or_default(),
                args: config.args.clone(),
                env: config.env.clone(),
                cwd: config.cwd.clone(),
            };
            Arc::new(StdioTransport::new(name, process, codec, timeout))
        }
    };
    Ok(transport)
}
