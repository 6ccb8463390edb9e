//! Streaming-HTTP transport.
//!
//! `connect` opens one long-lived GET whose response body is read
//! incrementally as newline-delimited JSON. Requests are separate POSTs to
//! the same URL; a `200` or `202` status is success.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::codec::MessageCodec;
use crate::error::McpError;
use crate::pending::PendingTable;
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use super::framing::LineBuffer;
use super::{encode_frame, Transport};

const NDJSON: &str = "application/x-ndjson";

/// Transport over a long-lived HTTP response stream.
pub struct StreamableHttpTransport {
    url: Url,
    client: reqwest::Client,
    table: Arc<PendingTable>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl StreamableHttpTransport {
    /// Build a transport for `url`. Fails with `InvalidServerConfig` when
    /// the URL or a header cannot be parsed.
    pub fn new(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
        codec: Arc<MessageCodec>,
        timeout: Duration,
    ) -> Result<Self, McpError> {
        Ok(Self {
            url: parse_url(server, url)?,
            client: build_client(server, headers)?,
            table: Arc::new(PendingTable::new(server, codec, timeout)),
            reader: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn open_stream(&self) -> Result<reqwest::Response, McpError> {
        let server = self.table.server();
        let request = self.client.get(self.url.clone()).header(ACCEPT, NDJSON).send();
        let response = tokio::time::timeout(self.table.timeout(), request)
            .await
            .map_err(|_| McpError::connection(server, "timed out opening stream"))?
            .map_err(|e| McpError::connection(server, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::connection(
                server,
                format!("stream request returned {status}"),
            ));
        }
        Ok(response)
    }

    async fn post(&self, frame: String) -> Result<(), McpError> {
        let server = self.table.server();
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, format!("application/json, {NDJSON}"))
            .body(frame)
            .send()
            .await
            .map_err(|e| McpError::send(server, e))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            return Err(McpError::send(server, format!("POST returned {status}")));
        }

        // Some servers answer inline instead of on the stream.
        match response.bytes().await {
            Ok(body) => {
                let mut lines = LineBuffer::new();
                let mut frames = lines.frames(&body);
                frames.extend(lines.take_remainder());
                for frame in &frames {
                    self.table.handle_incoming(frame);
                }
            }
            Err(e) => {
                debug!(server = %server, error = %e, "failed to read POST response body");
            }
        }
        Ok(())
    }

    fn abort_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Consume the response body line by line until it ends or fails.
async fn pump_lines<S>(table: Arc<PendingTable>, body: S)
where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    let mut body = std::pin::pin!(body);
    let mut lines = LineBuffer::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for frame in lines.frames(&bytes) {
                    table.handle_incoming(&frame);
                }
            }
            Err(e) => {
                warn!(server = %table.server(), error = %e, "response stream failed");
                table.cleanup();
                return;
            }
        }
    }
    if let Some(rest) = lines.take_remainder() {
        table.handle_incoming(&rest);
    }
    info!(server = %table.server(), "response stream ended");
    table.cleanup();
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn server_name(&self) -> &str {
        self.table.server()
    }

    async fn connect(&self) -> Result<(), McpError> {
        let _serial = self.connect_lock.lock().await;
        if !self.table.begin_connect()? {
            return Ok(());
        }

        let response = match self.open_stream().await {
            Ok(r) => r,
            Err(e) => {
                self.table.fail_connect();
                return Err(e);
            }
        };

        self.table.mark_connected()?;
        let handle = tokio::spawn(pump_lines(
            Arc::clone(&self.table),
            response.bytes_stream(),
        ));
        *self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        info!(server = %self.table.server(), url = %self.url, "streaming HTTP transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        self.table.cleanup();
        self.abort_reader();
        Ok(())
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let frame = encode_frame(self.table.server(), &request)?;
        self.table.exchange(&request, self.post(frame)).await
    }

    async fn send_notification(
        &self,
        notification: JsonRpcNotification,
    ) -> Result<(), McpError> {
        if !self.table.is_connected() {
            return Err(McpError::closed(self.table.server()));
        }
        let frame = encode_frame(self.table.server(), &notification)?;
        self.table
            .bounded(&notification.method, self.post(frame))
            .await
    }

    fn is_connected(&self) -> bool {
        self.table.is_connected()
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.table.cleanup();
        self.abort_reader();
    }
}

// ── Shared HTTP helpers ──────────────────────────────────────────────

/// Parse a configured endpoint address.
pub(crate) fn parse_url(server: &str, raw: &str) -> Result<Url, McpError> {
    Url::parse(raw).map_err(|e| McpError::InvalidServerConfig {
        server: server.to_string(),
        reason: format!("invalid url '{raw}': {e}"),
    })
}

/// Build a client that sends `headers` on every request.
pub(crate) fn build_client(
    server: &str,
    headers: &HashMap<String, String>,
) -> Result<reqwest::Client, McpError> {
    let invalid = |reason: String| McpError::InvalidServerConfig {
        server: server.to_string(),
        reason,
    };

    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| invalid(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| invalid(format!("invalid value for header '{name}': {e}")))?;
        map.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(map)
        .build()
        .map_err(|e| invalid(format!("failed to build HTTP client: {e}")))
}
