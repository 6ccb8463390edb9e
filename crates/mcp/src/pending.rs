//! Pending-request table shared by every transport.
//!
//! Each transport embeds one [`PendingTable`]. The send path registers a
//! waiter per request id; the inbound path resolves waiters as responses
//! arrive. Both paths, plus the connection state they depend on, sit
//! behind a single mutex so a request can never be registered on a table
//! that is being torn down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::error::McpError;
use crate::types::{JsonRpcRequest, JsonRpcResponse, RequestId};

/// Default time a request may stay in flight.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle of a transport.
///
/// `Closed` is terminal: a closed transport is never reconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// What `handle_incoming` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A waiter was resolved or rejected.
    Resolved,
    /// The frame had no id.
    Notification,
    /// The frame had an id nobody is waiting for.
    Unmatched,
    /// The frame failed validation and was dropped.
    Malformed,
}

type Outcome = Result<JsonRpcResponse, McpError>;

struct Inner {
    state: ConnectionState,
    waiters: HashMap<RequestId, oneshot::Sender<Outcome>>,
}

/// Correlates responses to in-flight requests for one transport.
pub struct PendingTable {
    server: String,
    codec: Arc<MessageCodec>,
    timeout: Duration,
    inner: Mutex<Inner>,
    /// Flips to `true` on `cleanup`; wakes writes that are still in progress.
    closed: watch::Sender<bool>,
}

impl PendingTable {
    pub fn new(server: impl Into<String>, codec: Arc<MessageCodec>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            codec,
            timeout,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                waiters: HashMap::new(),
            }),
            closed: watch::channel(false).0,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().waiters.contains_key(&id)
    }

    /// Move to `Connecting`. Returns `Ok(false)` when already connected.
    pub fn begin_connect(&self) -> Result<bool, McpError> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Connected => Ok(false),
            ConnectionState::Disconnected => {
                inner.state = ConnectionState::Connecting;
                Ok(true)
            }
            ConnectionState::Connecting => Err(McpError::connection(
                &self.server,
                "connect already in progress",
            )),
            ConnectionState::Closed => Err(McpError::connection(
                &self.server,
                "transport was closed; create a new transport to reconnect",
            )),
        }
    }

    /// Move `Connecting` to `Connected`. Fails if the connection was torn
    /// down while connecting.
    pub fn mark_connected(&self) -> Result<(), McpError> {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Connecting {
            return Err(McpError::connection(
                &self.server,
                "connection closed during setup",
            ));
        }
        inner.state = ConnectionState::Connected;
        Ok(())
    }

    /// Record a failed connect attempt.
    pub fn fail_connect(&self) {
        let mut inner = self.lock();
        inner.state = ConnectionState::Disconnected;
    }

    /// Register `request`, run `send`, then wait for the matching response.
    ///
    /// `send` is only polled after the waiter is in place, so a response
    /// that races the write is never lost. The write and the wait share one
    /// deadline, and `cleanup` ends both with `TransportClosed`.
    pub async fn exchange<F>(&self, request: &JsonRpcRequest, send: F) -> Outcome
    where
        F: Future<Output = Result<(), McpError>>,
    {
        let mut rx = self.register(request.id)?;
        let _guard = WaiterGuard {
            table: self,
            id: request.id,
        };

        debug!(server = %self.server, id = request.id, method = %request.method, "sending request");
        let round_trip = async {
            let send = std::pin::pin!(send);
            tokio::select! {
                sent = send => sent?,
                // Settled before the write finished: answered inline or torn down.
                settled = &mut rx => return self.settle(settled),
            }
            let settled = (&mut rx).await;
            self.settle(settled)
        };

        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::Timeout {
                server: self.server.clone(),
                method: request.method.clone(),
                timeout: self.timeout,
            }),
        }
    }

    /// Run a one-way write under the request timeout. `cleanup` ends it
    /// early with `TransportClosed`.
    pub async fn bounded<F>(&self, method: &str, send: F) -> Result<(), McpError>
    where
        F: Future<Output = Result<(), McpError>>,
    {
        let closed = self.closed.subscribe();
        let write = async {
            tokio::select! {
                sent = send => sent,
                _ = wait_closed(closed) => Err(McpError::closed(&self.server)),
            }
        };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::Timeout {
                server: self.server.clone(),
                method: method.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    fn settle(&self, received: Result<Outcome, oneshot::error::RecvError>) -> Outcome {
        received.unwrap_or_else(|_| Err(McpError::closed(&self.server)))
    }

    fn register(&self, id: RequestId) -> Result<oneshot::Receiver<Outcome>, McpError> {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Connected {
            return Err(McpError::closed(&self.server));
        }
        if inner.waiters.contains_key(&id) {
            return Err(McpError::send(
                &self.server,
                format!("request id {id} is already in flight"),
            ));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Route one inbound text frame to its waiter.
    pub fn handle_incoming(&self, raw: &str) -> Disposition {
        let response = match self.codec.parse_response(raw) {
            Ok(r) => r,
            Err(e) => {
                warn!(server = %self.server, error = %e, "discarding malformed message");
                return Disposition::Malformed;
            }
        };

        let Some(id) = response.id else {
            debug!(server = %self.server, "discarding notification");
            return Disposition::Notification;
        };

        let Some(tx) = self.lock().waiters.remove(&id) else {
            debug!(server = %self.server, id, "response for unknown id, ignoring");
            return Disposition::Unmatched;
        };

        let outcome = match response.error.clone() {
            Some(err) => Err(McpError::from(err)),
            None => Ok(response),
        };
        // The receiver may have given up already; nothing else to do then.
        let _ = tx.send(outcome);
        Disposition::Resolved
    }

    /// Reject every waiter with `TransportClosed` and mark the table closed.
    /// Safe to call any number of times.
    pub fn cleanup(&self) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.state = ConnectionState::Closed;
            inner.waiters.drain().collect()
        };
        if !drained.is_empty() {
            info!(server = %self.server, count = drained.len(), "rejecting pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(McpError::closed(&self.server)));
        }
        self.closed.send_replace(true);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave `Inner` half-updated.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PendingTable")
            .field("server", &self.server)
            .field("state", &inner.state)
            .field("pending", &inner.waiters.len())
            .finish()
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let done = *closed.borrow_and_update();
        if done || closed.changed().await.is_err() {
            return;
        }
    }
}

/// Removes a waiter when its caller stops waiting, whatever the reason.
struct WaiterGuard<'a> {
    table: &'a PendingTable,
    id: RequestId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().waiters.remove(&self.id);
    }
}
