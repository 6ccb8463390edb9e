//! JSON-RPC message codec.
//!
//! Builds request envelopes with fresh ids and validates inbound response
//! envelopes. Pure and synchronous; the id counter is the only state.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};

use crate::error::McpError;
use crate::types::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    JSONRPC_VERSION,
};

/// Request builder and response parser.
///
/// One codec is shared by every transport of an aggregator, so ids are
/// unique across all servers the process talks to.
#[derive(Debug)]
pub struct MessageCodec {
    next_id: AtomicU64,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a request with a freshly allocated id.
    pub fn build_request(&self, method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(self.allocate_id(), method, params)
    }

    /// Build a notification (no id).
    pub fn build_notification(&self, method: &str, params: Option<Value>) -> JsonRpcNotification {
        JsonRpcNotification::new(method, params)
    }

    fn allocate_id(&self) -> RequestId {
        // Starts at 1 and only grows; wrapping would take 2^64 requests.
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Parse and validate one inbound JSON-RPC message.
    ///
    /// A message with an absent or `null` id is returned with `id: None`
    /// (a notification). A message with an id must carry exactly one of
    /// `result` and `error`.
    pub fn parse_response(&self, raw: &str) -> Result<JsonRpcResponse, McpError> {
        let value: Value = serde_json::from_str(raw.trim())
            .map_err(|e| McpError::MalformedResponse(format!("invalid JSON: {e}")))?;
        let Value::Object(mut obj) = value else {
            return Err(McpError::MalformedResponse(
                "payload is not a JSON object".into(),
            ));
        };

        match obj.get("jsonrpc") {
            Some(Value::String(tag)) if tag == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(McpError::MalformedResponse(format!(
                    "unexpected protocol tag {other}"
                )))
            }
            None => {
                return Err(McpError::MalformedResponse(
                    "missing jsonrpc protocol tag".into(),
                ))
            }
        }

        let id = parse_id(obj.get("id"))?;
        let result = obj.remove("result");
        let error = match obj.remove("error") {
            None | Some(Value::Null) => None,
            Some(raw_err) => Some(
                serde_json::from_value::<JsonRpcError>(raw_err)
                    .map_err(|e| McpError::MalformedResponse(format!("invalid error object: {e}")))?,
            ),
        };

        if id.is_some() {
            match (&result, &error) {
                (Some(_), Some(_)) => {
                    return Err(McpError::MalformedResponse(
                        "response carries both result and error".into(),
                    ))
                }
                (None, None) => {
                    return Err(McpError::MalformedResponse(describe_missing(&obj)));
                }
                _ => {}
            }
        }

        Ok(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
            error,
        })
    }

    /// True iff the response carries an error object.
    pub fn is_error(response: &JsonRpcResponse) -> bool {
        response.error.is_some()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Ids are numbers; a string holding a number is accepted for servers that
/// echo ids as text.
fn parse_id(raw: Option<&Value>) -> Result<Option<RequestId>, McpError> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| McpError::MalformedResponse(format!("unsupported id {n}"))),
        Some(Value::String(s)) => s
            .parse::<RequestId>()
            .map(Some)
            .map_err(|_| McpError::MalformedResponse(format!("unsupported id \"{s}\""))),
        Some(other) => Err(McpError::MalformedResponse(format!(
            "unsupported id {other}"
        ))),
    }
}

fn describe_missing(obj: &Map<String, Value>) -> String {
    if obj.contains_key("method") {
        "server-initiated requests are not supported".into()
    } else {
        "response carries neither result nor error".into()
    }
}
