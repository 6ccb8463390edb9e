//! In-memory transport backed by channel pairs.
//!
//! Frames the client sends arrive at the [`ChannelPeer`] as text, and text
//! the peer sends is routed through the same correlation path as bytes
//! from a real server. Dropping the peer behaves like the stream ending.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::codec::MessageCodec;
use crate::error::McpError;
use crate::pending::{PendingTable, DEFAULT_REQUEST_TIMEOUT};
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

use super::{encode_frame, Transport};

const CHANNEL_CAPACITY: usize = 64;

/// Client side of an in-memory connection.
pub struct ChannelTransport {
    table: Arc<PendingTable>,
    outbound: mpsc::Sender<String>,
    inbound: Mutex<Option<mpsc::Receiver<String>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Server side of an in-memory connection.
pub struct ChannelPeer {
    rx: mpsc::Receiver<String>,
    tx: mpsc::Sender<String>,
}

impl ChannelTransport {
    /// Create a connected pair with its own codec and the default timeout.
    pub fn pair(server: &str) -> (Self, ChannelPeer) {
        Self::with_codec(server, Arc::new(MessageCodec::new()), DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a pair sharing `codec`, with a custom request timeout.
    pub fn with_codec(
        server: &str,
        codec: Arc<MessageCodec>,
        timeout: Duration,
    ) -> (Self, ChannelPeer) {
        let (to_peer, peer_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (peer_tx, from_peer) = mpsc::channel(CHANNEL_CAPACITY);
        let transport = Self {
            table: Arc::new(PendingTable::new(server, codec, timeout)),
            outbound: to_peer,
            inbound: Mutex::new(Some(from_peer)),
            pump: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        };
        (transport, ChannelPeer { rx: peer_rx, tx: peer_tx })
    }

    /// The correlation table, for inspection.
    pub fn pending(&self) -> &PendingTable {
        &self.table
    }

    async fn write(&self, frame: String) -> Result<(), McpError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| McpError::send(self.table.server(), "peer closed"))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn server_name(&self) -> &str {
        self.table.server()
    }

    async fn connect(&self) -> Result<(), McpError> {
        let _serial = self.connect_lock.lock().await;
        if !self.table.begin_connect()? {
            return Ok(());
        }

        let taken = self
            .inbound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(mut inbound) = taken else {
            self.table.fail_connect();
            return Err(McpError::connection(
                self.table.server(),
                "channel already consumed",
            ));
        };

        let table = Arc::clone(&self.table);
        let handle = tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                table.handle_incoming(&text);
            }
            info!(server = %table.server(), "channel peer closed");
            table.cleanup();
        });
        *self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        self.table.mark_connected()
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        self.table.cleanup();
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let frame = encode_frame(self.table.server(), &request)?;
        self.table.exchange(&request, self.write(frame)).await
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
            .bounded(&notification.method, self.write(frame))
            .await
    }

    fn is_connected(&self) -> bool {
        self.table.is_connected()
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.table.cleanup();
        if let Some(handle) = self
            .pump
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl ChannelPeer {
    /// Next raw frame written by the client. `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next request written by the client, skipping notifications.
    pub async fn next_request(&mut self) -> Option<JsonRpcRequest> {
        while let Some(text) = self.rx.recv().await {
            if let Ok(request) = serde_json::from_str::<JsonRpcRequest>(&text) {
                return Some(request);
            }
        }
        None
    }

    /// Deliver raw text to the client. Returns `false` if the client is gone.
    pub async fn send(&self, text: impl Into<String>) -> bool {
        self.tx.send(text.into()).await.is_ok()
    }

    /// Answer request `id` with `result`.
    pub async fn respond(&self, id: RequestId, result: Value) -> bool {
        self.send_response(JsonRpcResponse::success(id, result)).await
    }

    /// Answer request `id` with a JSON-RPC error.
    pub async fn respond_error(&self, id: RequestId, code: i64, message: &str) -> bool {
        self.send_response(JsonRpcResponse::error(id, code, message))
            .await
    }

    async fn send_response(&self, response: JsonRpcResponse) -> bool {
        match serde_json::to_string(&response) {
            Ok(text) => self.send(text).await,
            Err(_) => false,
        }
    }
}
