//! Event-stream transport.
//!
//! `connect` subscribes to the server's `text/event-stream` endpoint and
//! waits for the `endpoint` event, which names the session URL every
//! outbound message is POSTed to. After that, each `message` event carries
//! one JSON-RPC message.
//!
//! Failures before the endpoint arrives fail `connect`. Failures after it
//! are logged and close the session; callers see them as `TransportClosed`
//! on in-flight requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::codec::MessageCodec;
use crate::error::McpError;
use crate::pending::PendingTable;
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use super::framing::EventStreamDecoder;
use super::http::{build_client, parse_url};
use super::{encode_frame, Transport};

type EndpointResult = Result<Url, McpError>;

/// Transport over a server-sent events subscription.
pub struct SseTransport {
    url: Url,
    client: reqwest::Client,
    table: Arc<PendingTable>,
    endpoint: Mutex<Option<Url>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl SseTransport {
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
            endpoint: Mutex::new(None),
            reader: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Session URL announced by the server, once connected.
    pub fn session_endpoint(&self) -> Option<Url> {
        self.endpoint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Subscribe and wait for the session endpoint, all within the request
    /// timeout.
    async fn open_session(&self) -> Result<(Url, JoinHandle<()>), McpError> {
        let server = self.table.server();
        let deadline = tokio::time::Instant::now() + self.table.timeout();

        let request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();
        let response = tokio::time::timeout_at(deadline, request)
            .await
            .map_err(|_| McpError::connection(server, "timed out opening event stream"))?
            .map_err(|e| McpError::connection(server, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::connection(
                server,
                format!("event stream request returned {status}"),
            ));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let handle = tokio::spawn(pump_events(
            Arc::clone(&self.table),
            self.url.clone(),
            response.bytes_stream(),
            endpoint_tx,
        ));

        let outcome = match tokio::time::timeout_at(deadline, endpoint_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::connection(
                server,
                "event stream ended before the endpoint event",
            )),
            Err(_) => Err(McpError::connection(
                server,
                "timed out waiting for the endpoint event",
            )),
        };
        match outcome {
            Ok(endpoint) => Ok((endpoint, handle)),
            Err(e) => {
                handle.abort();
                Err(e)
            }
        }
    }

    async fn post(&self, frame: String) -> Result<(), McpError> {
        let server = self.table.server();
        let endpoint = self.session_endpoint().ok_or_else(|| McpError::closed(server))?;

        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(frame)
            .send()
            .await
            .map_err(|e| McpError::send(server, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::send(server, format!("POST returned {status}")));
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

/// Read events until the stream ends.
///
/// Until the endpoint is known, outcomes go to `endpoint_tx` and the table
/// is left alone. Afterwards, a stream failure or end closes the table.
async fn pump_events<S>(
    table: Arc<PendingTable>,
    base: Url,
    body: S,
    endpoint_tx: oneshot::Sender<EndpointResult>,
) where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    let mut body = std::pin::pin!(body);
    let server = table.server().to_string();
    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = EventStreamDecoder::new();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(Err(McpError::connection(&server, e)));
                    return;
                }
                warn!(server = %server, error = %e, "event stream failed; closing session");
                table.cleanup();
                return;
            }
        };

        for event in decoder.push(&bytes) {
            match event.event.as_str() {
                "endpoint" => {
                    let Some(tx) = endpoint_tx.take() else {
                        debug!(server = %server, "ignoring repeated endpoint event");
                        continue;
                    };
                    match base.join(event.data.trim()) {
                        Ok(url) => {
                            info!(server = %server, endpoint = %url, "received session endpoint");
                            let _ = tx.send(Ok(url));
                        }
                        Err(e) => {
                            let _ = tx.send(Err(McpError::connection(
                                &server,
                                format!("invalid endpoint '{}': {e}", event.data),
                            )));
                            return;
                        }
                    }
                }
                "message" => {
                    table.handle_incoming(&event.data);
                }
                other => {
                    debug!(server = %server, event = %other, "ignoring event");
                }
            }
        }
    }

    if endpoint_tx.is_some() {
        // Dropping the sender reports the early end to `connect`.
        return;
    }
    info!(server = %server, "event stream ended");
    table.cleanup();
}

#[async_trait]
impl Transport for SseTransport {
    fn server_name(&self) -> &str {
        self.table.server()
    }

    async fn connect(&self) -> Result<(), McpError> {
        let _serial = self.connect_lock.lock().await;
        if !self.table.begin_connect()? {
            return Ok(());
        }

        let (endpoint, handle) = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                self.table.fail_connect();
                return Err(e);
            }
        };

        *self
            .endpoint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(endpoint);
        *self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        if let Err(e) = self.table.mark_connected() {
            self.abort_reader();
            return Err(e);
        }
        info!(server = %self.table.server(), url = %self.url, "SSE transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        self.table.cleanup();
        self.abort_reader();
        self.endpoint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
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

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.table.cleanup();
        self.abort_reader();
    }
}
