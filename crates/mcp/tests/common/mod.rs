//! In-process MCP server used by the HTTP-based integration tests.
//!
//! Routes:
//! - `GET /sse` event stream announcing `/messages?session=1`, `POST /messages`
//! - `GET /sse-silent` event stream that never announces an endpoint
//! - `GET /sse-stall` event stream announcing `/messages-stall`, whose POSTs never complete
//! - `GET /sse-reject` event stream announcing `/messages-reject`, whose POSTs get 400
//! - `GET|POST /mcp` NDJSON stream, responses delivered on the stream
//! - `POST /inline` responses delivered in the POST body instead
//! - `POST /reject` always 400
//! - `POST /stall` records the message, then never responds
//! - `GET /private` NDJSON stream behind a bearer token
//! - `GET /broken` always 500

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const TOKEN: &str = "t0ken";

#[derive(Default)]
pub struct MockState {
    sse: Mutex<Option<mpsc::UnboundedSender<String>>>,
    ndjson: Mutex<Option<mpsc::UnboundedSender<String>>>,
    received: Mutex<Vec<String>>,
}

impl MockState {
    /// Methods of every message POSTed so far, notifications included.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// End both long-lived streams.
    pub fn close_streams(&self) {
        self.sse.lock().unwrap().take();
        self.ndjson.lock().unwrap().take();
    }

    fn record(&self, message: &Value) {
        let method = message["method"].as_str().unwrap_or("<response>");
        self.received.lock().unwrap().push(method.to_string());
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        tokio::spawn(async move { axum::serve(listener, app).await });
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Wait until the server has seen a message with `method`.
    pub async fn wait_for(&self, method: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.state.received().iter().any(|m| m == method) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "server never received {method}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/sse", get(|state: State<Arc<MockState>>| sse_stream(state, "/messages?session=1")))
        .route("/sse-silent", get(sse_silent))
        .route("/sse-stall", get(|state: State<Arc<MockState>>| sse_stream(state, "/messages-stall")))
        .route("/sse-reject", get(|state: State<Arc<MockState>>| sse_stream(state, "/messages-reject")))
        .route("/messages", post(sse_post))
        .route("/messages-stall", post(stalled_post))
        .route("/messages-reject", post(|| async { StatusCode::BAD_REQUEST }))
        .route("/mcp", get(ndjson_stream).post(ndjson_post))
        .route("/inline", get(ndjson_stream).post(inline_post))
        .route("/reject", get(ndjson_stream).post(|| async { StatusCode::BAD_REQUEST }))
        .route("/stall", get(ndjson_stream).post(stalled_post))
        .route("/private", get(private_stream).post(ndjson_post))
        .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .with_state(state)
}

/// The mock's behaviour: answer known methods, stay silent for the tool
/// named `never`, reject anything else.
pub fn answer(message: &Value) -> Option<Value> {
    let id = message.get("id")?.clone();
    let method = message["method"].as_str()?;
    let params = &message["params"];
    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "mock", "version": "1.0"}
        }),
        "tools/list" => json!({"tools": [{"name": "echo", "description": "Echo text back"}]}),
        "tools/call" => match params["name"].as_str() {
            Some("never") => return None,
            Some("echo") | Some("fragmented") => json!({
                "content": [{"type": "text", "text": params["arguments"]["text"]}]
            }),
            _ => {
                return Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32602, "message": "Unknown tool"}
                }))
            }
        },
        "resources/list" => json!({"resources": [{"uri": "mock://readme", "name": "readme"}]}),
        "resources/read" => json!({"contents": [{"uri": params["uri"], "text": "mock contents"}]}),
        "prompts/list" => json!({"prompts": [{"name": "greet"}]}),
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            }))
        }
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

// ── Event stream ────────────────────────────────────────────────────

async fn sse_stream(
    State(state): State<Arc<MockState>>,
    endpoint: &'static str,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    *state.sse.lock().unwrap() = Some(tx);

    let endpoint = futures::stream::once(async move {
        Ok(Event::default().event("endpoint").data(endpoint))
    });
    let messages = UnboundedReceiverStream::new(rx)
        .map(|text| Ok(Event::default().event("message").data(text)));
    Sse::new(endpoint.chain(messages)).keep_alive(KeepAlive::default())
}

async fn sse_silent() -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    Sse::new(futures::stream::pending::<Result<Event, Infallible>>())
}

async fn sse_post(State(state): State<Arc<MockState>>, Json(message): Json<Value>) -> StatusCode {
    state.record(&message);
    if let Some(reply) = answer(&message) {
        if let Some(tx) = state.sse.lock().unwrap().as_ref() {
            let _ = tx.send(reply.to_string());
        }
    }
    StatusCode::ACCEPTED
}

/// Accept the message, then hold the response open for an hour.
async fn stalled_post(State(state): State<Arc<MockState>>, Json(message): Json<Value>) -> StatusCode {
    state.record(&message);
    tokio::time::sleep(Duration::from_secs(3600)).await;
    StatusCode::ACCEPTED
}

// ── NDJSON stream ───────────────────────────────────────────────────

fn open_ndjson(state: &MockState) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    *state.ndjson.lock().unwrap() = Some(tx);
    let body = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response()
}

async fn ndjson_stream(State(state): State<Arc<MockState>>) -> Response {
    open_ndjson(&state)
}

async fn private_stream(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let expected = format!("Bearer {TOKEN}");
    match headers.get(header::AUTHORIZATION) {
        Some(value) if value.as_bytes() == expected.as_bytes() => open_ndjson(&state),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn ndjson_post(State(state): State<Arc<MockState>>, Json(message): Json<Value>) -> StatusCode {
    state.record(&message);
    let Some(reply) = answer(&message) else {
        return StatusCode::ACCEPTED;
    };
    let text = format!("{reply}\n");
    if let Some(tx) = state.ndjson.lock().unwrap().as_ref() {
        if message["params"]["name"] == "fragmented" {
            // Deliver one message in three pieces.
            let (head, tail) = text.split_at(text.len() / 3);
            let (middle, last) = tail.split_at(tail.len() / 2);
            for piece in [head, middle, last] {
                let _ = tx.send(piece.to_string());
            }
        } else {
            let _ = tx.send(text);
        }
    }
    StatusCode::ACCEPTED
}

async fn inline_post(State(state): State<Arc<MockState>>, Json(message): Json<Value>) -> Response {
    state.record(&message);
    match answer(&message) {
        Some(reply) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            format!("{reply}\n"),
        )
            .into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}
