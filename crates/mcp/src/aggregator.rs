//! Multi-server aggregation.
//!
//! The [`Aggregator`] owns one transport per configured server. List
//! operations fan out to every server at once and merge whatever comes
//! back; call operations go to exactly one named server.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::config::{ConfigSource, ServersConfig};
use crate::error::McpError;
use crate::factory::{DefaultTransportFactory, TransportFactory};
use crate::handshake;
use crate::pending::DEFAULT_REQUEST_TIMEOUT;
use crate::transport::Transport;
use crate::types::{
    methods, CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, ListParams,
    ListPromptsResult, ListResourcesResult, ListToolsResult, Prompt, ReadResourceParams,
    ReadResourceResult, Resource, Tagged, Tool,
};

/// Upper bound on `nextCursor` pages fetched from one server per call.
pub const MAX_LIST_PAGES: usize = 64;

/// Tunables for an [`Aggregator`].
#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    /// Request timeout for servers without their own `timeoutMs`.
    pub request_timeout: Duration,
    /// Run the MCP `initialize` exchange after each transport connects.
    pub handshake: bool,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            handshake: true,
        }
    }
}

type Registry = IndexMap<String, Arc<dyn Transport>>;

/// Client for many MCP servers at once.
pub struct Aggregator {
    source: Box<dyn ConfigSource>,
    factory: Arc<dyn TransportFactory>,
    codec: Arc<MessageCodec>,
    options: AggregatorOptions,
    registry: RwLock<Registry>,
    /// Serializes `connect` and `disconnect`.
    lifecycle: Mutex<()>,
}

impl Aggregator {
    pub fn new(source: impl ConfigSource + 'static) -> Self {
        Self::with_options(source, AggregatorOptions::default())
    }

    pub fn with_options(source: impl ConfigSource + 'static, options: AggregatorOptions) -> Self {
        let codec = Arc::new(MessageCodec::new());
        let factory = Arc::new(DefaultTransportFactory::new(
            Arc::clone(&codec),
            options.request_timeout,
        ));
        Self::build(Box::new(source), factory, codec, options)
    }

    /// Use `factory` instead of the built-in transports.
    pub fn with_factory(
        source: impl ConfigSource + 'static,
        factory: Arc<dyn TransportFactory>,
        options: AggregatorOptions,
    ) -> Self {
        Self::build(
            Box::new(source),
            factory,
            Arc::new(MessageCodec::new()),
            options,
        )
    }

    fn build(
        source: Box<dyn ConfigSource>,
        factory: Arc<dyn TransportFactory>,
        codec: Arc<MessageCodec>,
        options: AggregatorOptions,
    ) -> Self {
        Self {
            source,
            factory,
            codec,
            options,
            registry: RwLock::new(IndexMap::new()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &AggregatorOptions {
        &self.options
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Load the configuration and connect every server concurrently.
    ///
    /// Servers that are already connected are kept as they are. If any
    /// server fails, the call returns `ConnectFailed` listing each failure,
    /// but the servers that did connect stay registered and usable.
    /// Configuration errors abort before any connection is attempted.
    pub async fn connect(&self) -> Result<(), McpError> {
        let _lifecycle = self.lifecycle.lock().await;

        let config = self.source.load()?;
        if config.is_empty() {
            return Err(McpError::NoServersConfigured);
        }

        let mut fresh: Vec<(String, Arc<dyn Transport>)> = Vec::new();
        {
            let registry = self.registry.read().await;
            for (name, server) in config.iter() {
                if registry.get(name).is_some_and(|t| t.is_connected()) {
                    debug!(server = %name, "already connected, keeping");
                    continue;
                }
                fresh.push((name.clone(), self.factory.create(name, server)?));
            }
        }
        self.prune(&config).await;
        if fresh.is_empty() {
            return Ok(());
        }

        info!(count = fresh.len(), "connecting MCP servers");
        let results = join_all(
            fresh
                .iter()
                .map(|(_, transport)| self.open(Arc::clone(transport))),
        )
        .await;

        let mut failures = Vec::new();
        let mut registry = self.registry.write().await;
        for ((name, transport), result) in fresh.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(server = %name, "connected");
                    registry.insert(name, transport);
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "failed to connect");
                    registry.shift_remove(&name);
                    failures.push((name, e));
                }
            }
        }
        // Keep configuration order regardless of which servers were kept.
        registry.sort_by(|a, _, b, _| {
            config
                .servers
                .get_index_of(a)
                .cmp(&config.servers.get_index_of(b))
        });

        if failures.is_empty() {
            Ok(())
        } else {
            Err(McpError::ConnectFailed { failures })
        }
    }

    /// Disconnect and forget servers that are no longer configured.
    async fn prune(&self, config: &ServersConfig) {
        let stale: Vec<(String, Arc<dyn Transport>)> = {
            let mut registry = self.registry.write().await;
            let names: Vec<String> = registry
                .keys()
                .filter(|name| config.get(name).is_none())
                .cloned()
                .collect();
            names
                .into_iter()
                .filter_map(|name| registry.shift_remove_entry(&name))
                .collect()
        };
        for (name, transport) in stale {
            info!(server = %name, "removed from configuration, disconnecting");
            if let Err(e) = transport.disconnect().await {
                warn!(server = %name, error = %e, "error while disconnecting");
            }
        }
    }

    async fn open(&self, transport: Arc<dyn Transport>) -> Result<(), McpError> {
        transport.connect().await?;
        if self.options.handshake {
            if let Err(e) = handshake::initialize(transport.as_ref(), &self.codec).await {
                let _ = transport.disconnect().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Disconnect every registered server concurrently, then clear the
    /// registry. Per-server errors are logged, never returned.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let entries = self.snapshot().await;
        let results = join_all(entries.iter().map(|(_, t)| t.disconnect())).await;
        for ((name, _), result) in entries.iter().zip(results) {
            match result {
                Ok(()) => debug!(server = %name, "disconnected"),
                Err(e) => warn!(server = %name, error = %e, "error while disconnecting"),
            }
        }

        self.registry.write().await.clear();
        info!(count = entries.len(), "all MCP servers disconnected");
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Names of connected servers, in configuration order.
    pub async fn get_connected_servers(&self) -> Vec<String> {
        self.registry
            .read()
            .await
            .iter()
            .filter(|(_, t)| t.is_connected())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `false` for unknown names.
    pub async fn is_server_connected(&self, server: &str) -> bool {
        self.registry
            .read()
            .await
            .get(server)
            .is_some_and(|t| t.is_connected())
    }

    /// The registered transport for `server`, if any.
    pub async fn transport(&self, server: &str) -> Option<Arc<dyn Transport>> {
        self.registry.read().await.get(server).cloned()
    }

    async fn snapshot(&self) -> Vec<(String, Arc<dyn Transport>)> {
        self.registry
            .read()
            .await
            .iter()
            .map(|(name, t)| (name.clone(), Arc::clone(t)))
            .collect()
    }

    // ── Fan-out listing ────────────────────────────────────────────

    /// Tools from every server, tagged with their server's name.
    pub async fn list_tools(&self) -> Vec<Tagged<Tool>> {
        self.list_all::<ListToolsResult>(methods::TOOLS_LIST).await
    }

    pub async fn list_resources(&self) -> Vec<Tagged<Resource>> {
        self.list_all::<ListResourcesResult>(methods::RESOURCES_LIST)
            .await
    }

    pub async fn list_prompts(&self) -> Vec<Tagged<Prompt>> {
        self.list_all::<ListPromptsResult>(methods::PROMPTS_LIST).await
    }

    async fn list_all<P: Page>(&self, method: &str) -> Vec<Tagged<P::Item>> {
        let entries = self.snapshot().await;
        let results = join_all(
            entries
                .iter()
                .map(|(_, transport)| self.list_server::<P>(transport.as_ref(), method)),
        )
        .await;

        let mut merged = Vec::new();
        for ((name, _), result) in entries.iter().zip(results) {
            match result {
                Ok(items) => {
                    debug!(server = %name, method, count = items.len(), "listed");
                    merged.extend(items.into_iter().map(|item| Tagged::new(name.as_str(), item)));
                }
                Err(e) => {
                    warn!(server = %name, method, error = %e, "list failed, skipping server");
                }
            }
        }
        merged
    }

    async fn list_server<P: Page>(
        &self,
        transport: &dyn Transport,
        method: &str,
    ) -> Result<Vec<P::Item>, McpError> {
        let mut items = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_LIST_PAGES {
            let page: P = self
                .request(transport, method, &ListParams { cursor })
                .await?;
            let (batch, next) = page.into_parts();
            items.extend(batch);
            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }
        warn!(
            server = %transport.server_name(),
            method,
            pages = MAX_LIST_PAGES,
            "page limit reached, returning partial list"
        );
        Ok(items)
    }

    // ── Single-server calls ────────────────────────────────────────

    /// Invoke tool `name` on `server`.
    pub async fn call_tool(
        &self,
        server: &str,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        self.call(server, methods::TOOLS_CALL, &params).await
    }

    pub async fn read_resource(
        &self,
        server: &str,
        uri: &str,
    ) -> Result<ReadResourceResult, McpError> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.call(server, methods::RESOURCES_READ, &params).await
    }

    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<GetPromptResult, McpError> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.call(server, methods::PROMPTS_GET, &params).await
    }

    async fn call<R: DeserializeOwned>(
        &self,
        server: &str,
        method: &str,
        params: &impl Serialize,
    ) -> Result<R, McpError> {
        let transport = self
            .transport(server)
            .await
            .ok_or_else(|| McpError::ServerNotFound(server.to_string()))?;

        self.request(transport.as_ref(), method, params)
            .await
            .map_err(|e| match e {
                McpError::RpcError { code, message, .. } => McpError::CallFailed {
                    server: server.to_string(),
                    method: method.to_string(),
                    code,
                    message,
                },
                other => other,
            })
    }

    /// One request on one transport, with the result decoded as `R`.
    async fn request<R: DeserializeOwned>(
        &self,
        transport: &dyn Transport,
        method: &str,
        params: &impl Serialize,
    ) -> Result<R, McpError> {
        let params = serde_json::to_value(params)
            .map_err(|e| McpError::send(transport.server_name(), format!("invalid params: {e}")))?;
        let response = transport
            .send_request(self.codec.build_request(method, Some(params)))
            .await?;
        serde_json::from_value(response.result_or_null().clone()).map_err(|e| {
            McpError::MalformedResponse(format!(
                "{method} result from '{}': {e}",
                transport.server_name()
            ))
        })
    }
}

/// A decoded page of a `*/list` result.
trait Page: DeserializeOwned + Send {
    type Item: Send;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Page for ListToolsResult {
    type Item = Tool;
    fn into_parts(self) -> (Vec<Tool>, Option<String>) {
        (self.tools, self.next_cursor)
    }
}

impl Page for ListResourcesResult {
    type Item = Resource;
    fn into_parts(self) -> (Vec<Resource>, Option<String>) {
        (self.resources, self.next_cursor)
    }
}

impl Page for ListPromptsResult {
    type Item = Prompt;
    fn into_parts(self) -> (Vec<Prompt>, Option<String>) {
        (self.prompts, self.next_cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::ServerConfig;
    use crate::transport::{ChannelPeer, ChannelTransport};
    use crate::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

    type Reply = Option<Result<Value, (i64, String)>>;

    /// Hands out prepared transports by server name.
    #[derive(Default)]
    struct Prepared {
        transports: StdMutex<HashMap<String, Arc<dyn Transport>>>,
    }

    impl Prepared {
        fn add(&self, transport: Arc<dyn Transport>) {
            self.transports
                .lock()
                .unwrap()
                .insert(transport.server_name().to_string(), transport);
        }
    }

    impl TransportFactory for Prepared {
        fn create(&self, name: &str, config: &ServerConfig) -> Result<Arc<dyn Transport>, McpError> {
            config.validate(name)?;
            self.transports
                .lock()
                .unwrap()
                .remove(name)
                .ok_or_else(|| McpError::connection(name, "no prepared transport"))
        }
    }

    /// A server that can never be reached.
    struct Unreachable(String);

    #[async_trait]
    impl Transport for Unreachable {
        fn server_name(&self) -> &str {
            &self.0
        }
        async fn connect(&self) -> Result<(), McpError> {
            Err(McpError::connection(&self.0, "connection refused"))
        }
        async fn disconnect(&self) -> Result<(), McpError> {
            Ok(())
        }
        async fn send_request(&self, _: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
            Err(McpError::closed(&self.0))
        }
        async fn send_notification(&self, _: JsonRpcNotification) -> Result<(), McpError> {
            Err(McpError::closed(&self.0))
        }
        fn is_connected(&self) -> bool {
            false
        }
    }

    /// Answer every request with `handler`; `None` means stay silent.
    fn serve<F>(mut peer: ChannelPeer, handler: F) -> tokio::task::JoinHandle<Vec<String>>
    where
        F: Fn(&JsonRpcRequest) -> Reply + Send + 'static,
    {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(req) = peer.next_request().await {
                seen.push(req.method.clone());
                match handler(&req) {
                    Some(Ok(result)) => {
                        peer.respond(req.id, result).await;
                    }
                    Some(Err((code, message))) => {
                        peer.respond_error(req.id, code, &message).await;
                    }
                    None => {}
                }
            }
            seen
        })
    }

    fn channel(name: &str, timeout: Duration) -> (Arc<dyn Transport>, ChannelPeer) {
        let (t, peer) = ChannelTransport::with_codec(name, Arc::new(MessageCodec::new()), timeout);
        (Arc::new(t), peer)
    }

    fn no_handshake() -> AggregatorOptions {
        AggregatorOptions {
            handshake: false,
            ..Default::default()
        }
    }

    fn config(names: &[&str]) -> ServersConfig {
        names.iter().fold(ServersConfig::new(), |cfg, name| {
            cfg.with_server(*name, ServerConfig::remote(format!("http://{name}.test/sse")))
        })
    }

    fn tools_reply(names: &[&str]) -> Value {
        json!({"tools": names.iter().map(|n| json!({"name": n})).collect::<Vec<_>>()})
    }

    #[tokio::test]
    async fn test_silent_server_does_not_break_list_tools() {
        let factory = Arc::new(Prepared::default());
        let (a, peer_a) = channel("A", Duration::from_millis(30));
        let (b, peer_b) = channel("B", Duration::from_millis(30));
        factory.add(a);
        factory.add(b);
        serve(peer_a, |_| Some(Ok(tools_reply(&["x"]))));
        serve(peer_b, |_| None);

        let agg = Aggregator::with_factory(config(&["A", "B"]), factory, no_handshake());
        agg.connect().await.unwrap();

        let tools = agg.list_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].item.name, "x");
        assert_eq!(tools[0].server_name, "A");
        assert_eq!(
            serde_json::to_value(&tools[0]).unwrap(),
            json!({"name": "x", "serverName": "A"})
        );
    }

    #[tokio::test]
    async fn test_list_merges_in_server_order() {
        let factory = Arc::new(Prepared::default());
        let (first, peer1) = channel("first", DEFAULT_REQUEST_TIMEOUT);
        let (second, peer2) = channel("second", DEFAULT_REQUEST_TIMEOUT);
        factory.add(first);
        factory.add(second);
        serve(peer1, |_| Some(Ok(tools_reply(&["a1", "a2"]))));
        serve(peer2, |req| match req.method.as_str() {
            "tools/list" => Some(Ok(tools_reply(&["b1"]))),
            _ => Some(Err((error_codes::METHOD_NOT_FOUND, "nope".into()))),
        });

        let agg = Aggregator::with_factory(config(&["first", "second"]), factory, no_handshake());
        agg.connect().await.unwrap();

        let tagged: Vec<_> = agg
            .list_tools()
            .await
            .into_iter()
            .map(|t| (t.server_name, t.item.name))
            .collect();
        assert_eq!(
            tagged,
            vec![
                ("first".to_string(), "a1".to_string()),
                ("first".to_string(), "a2".to_string()),
                ("second".to_string(), "b1".to_string()),
            ]
        );

        // `second` rejects prompts/list; `first` answers with a tools payload
        // which decodes as an empty prompt page.
        assert!(agg.list_prompts().await.is_empty());
    }

    #[tokio::test]
    async fn test_pagination_follows_next_cursor() {
        let factory = Arc::new(Prepared::default());
        let (t, peer) = channel("paged", DEFAULT_REQUEST_TIMEOUT);
        factory.add(t);
        serve(peer, |req| {
            let cursor = req.params.as_ref().and_then(|p| p.get("cursor")).cloned();
            Some(Ok(match cursor {
                None => json!({"resources": [{"uri": "file:///1"}], "nextCursor": "p2"}),
                Some(_) => json!({"resources": [{"uri": "file:///2", "mimeType": "text/plain"}]}),
            }))
        });

        let agg = Aggregator::with_factory(config(&["paged"]), factory, no_handshake());
        agg.connect().await.unwrap();

        let resources = agg.list_resources().await;
        let uris: Vec<_> = resources.iter().map(|r| r.item.uri.as_str()).collect();
        assert_eq!(uris, vec!["file:///1", "file:///2"]);
        assert_eq!(resources[1].item.mime_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_call_tool_on_unknown_server_does_no_io() {
        let factory = Arc::new(Prepared::default());
        let (t, mut peer) = channel("real", DEFAULT_REQUEST_TIMEOUT);
        factory.add(t);

        let agg = Aggregator::with_factory(config(&["real"]), factory, no_handshake());
        agg.connect().await.unwrap();

        let err = agg.call_tool("ghost", "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound(ref s) if s == "ghost"));
        let nothing = tokio::time::timeout(Duration::from_millis(20), peer.recv()).await;
        assert!(nothing.is_err(), "no frame should have been sent");
    }

    #[tokio::test]
    async fn test_call_operations_and_rpc_error_translation() {
        let factory = Arc::new(Prepared::default());
        let (t, peer) = channel("srv", DEFAULT_REQUEST_TIMEOUT);
        factory.add(t);
        let handled = serve(peer, |req| {
            let params = req.params.clone().unwrap_or_default();
            match (req.method.as_str(), params["name"].as_str()) {
                ("tools/call", Some("echo")) => Some(Ok(json!({
                    "content": [{"type": "text", "text": params["arguments"]["msg"]}]
                }))),
                ("tools/call", _) => Some(Err((error_codes::INVALID_PARAMS, "unknown tool".into()))),
                ("resources/read", _) => Some(Ok(json!({
                    "contents": [{"uri": params["uri"], "text": "hello"}]
                }))),
                ("prompts/get", Some(name)) => Some(Ok(json!({
                    "description": format!("prompt {name}"),
                    "messages": [{"role": "user", "content": {"type": "text", "text": params["arguments"]["topic"]}}]
                }))),
                _ => None,
            }
        });

        let agg = Aggregator::with_factory(config(&["srv"]), factory, no_handshake());
        agg.connect().await.unwrap();

        let result = agg.call_tool("srv", "echo", json!({"msg": "hi"})).await.unwrap();
        assert_eq!(result.content, vec![json!({"type": "text", "text": "hi"})]);
        assert!(!result.is_error);

        match agg.call_tool("srv", "missing", json!({})).await.unwrap_err() {
            McpError::CallFailed {
                server,
                method,
                code,
                message,
            } => {
                assert_eq!(server, "srv");
                assert_eq!(method, "tools/call");
                assert_eq!(code, error_codes::INVALID_PARAMS);
                assert_eq!(message, "unknown tool");
            }
            other => panic!("expected CallFailed, got {other:?}"),
        }

        let read = agg.read_resource("srv", "mem://greeting").await.unwrap();
        assert_eq!(read.contents[0]["uri"], "mem://greeting");

        let prompt = agg
            .get_prompt("srv", "brief", Some(json!({"topic": "rust"})))
            .await
            .unwrap();
        assert_eq!(prompt.description.as_deref(), Some("prompt brief"));
        assert_eq!(prompt.messages[0]["content"]["text"], "rust");

        agg.disconnect().await;
        let methods = handled.await.unwrap();
        assert_eq!(
            methods,
            vec!["tools/call", "tools/call", "resources/read", "prompts/get"]
        );
    }

    #[tokio::test]
    async fn test_empty_config_fails() {
        let agg = Aggregator::with_factory(
            ServersConfig::new(),
            Arc::new(Prepared::default()),
            no_handshake(),
        );
        assert!(matches!(
            agg.connect().await.unwrap_err(),
            McpError::NoServersConfigured
        ));
    }

    #[tokio::test]
    async fn test_invalid_server_config_aborts_before_connecting() {
        let factory = Arc::new(Prepared::default());
        let (good, _peer) = channel("good", DEFAULT_REQUEST_TIMEOUT);
        factory.add(good);
        let cfg = config(&["good"]).with_server("broken", ServerConfig::default());

        let agg = Aggregator::with_factory(cfg, factory, no_handshake());
        let err = agg.connect().await.unwrap_err();
        assert!(matches!(err, McpError::InvalidServerConfig { ref server, .. } if server == "broken"));
        assert!(agg.get_connected_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_connect_failure_keeps_good_servers() {
        let factory = Arc::new(Prepared::default());
        let (good, peer) = channel("good", DEFAULT_REQUEST_TIMEOUT);
        factory.add(good);
        factory.add(Arc::new(Unreachable("bad".into())));
        serve(peer, |_| Some(Ok(tools_reply(&["t"]))));

        let agg = Aggregator::with_factory(config(&["bad", "good"]), factory, no_handshake());
        match agg.connect().await.unwrap_err() {
            McpError::ConnectFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "bad");
                assert!(matches!(failures[0].1, McpError::ConnectionError { .. }));
            }
            other => panic!("expected ConnectFailed, got {other:?}"),
        }

        assert_eq!(agg.get_connected_servers().await, vec!["good"]);
        assert!(agg.is_server_connected("good").await);
        assert!(!agg.is_server_connected("bad").await);
        assert!(!agg.is_server_connected("never-heard-of-it").await);
        assert_eq!(agg.list_tools().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_connected_servers() {
        let factory = Arc::new(Prepared::default());
        let (t, _peer) = channel("only", DEFAULT_REQUEST_TIMEOUT);
        factory.add(t);

        let agg = Aggregator::with_factory(config(&["only"]), factory, no_handshake());
        agg.connect().await.unwrap();
        let before = agg.transport("only").await.unwrap();
        // The factory has nothing left to hand out, so a rebuild would fail.
        agg.connect().await.unwrap();
        let after = agg.transport("only").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    /// A configuration the test can edit between `connect` calls.
    struct Editable(Arc<StdMutex<ServersConfig>>);

    impl ConfigSource for Editable {
        fn load(&self) -> Result<ServersConfig, McpError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn test_reconnect_drops_servers_removed_from_config() {
        let factory = Arc::new(Prepared::default());
        let (kept, peer_kept) = channel("kept", DEFAULT_REQUEST_TIMEOUT);
        let (gone, peer_gone) = channel("gone", DEFAULT_REQUEST_TIMEOUT);
        let gone_handle = Arc::clone(&gone);
        factory.add(kept);
        factory.add(gone);
        serve(peer_kept, |_| Some(Ok(tools_reply(&["k"]))));
        serve(peer_gone, |_| Some(Ok(tools_reply(&["g"]))));

        let shared = Arc::new(StdMutex::new(config(&["kept", "gone"])));
        let agg = Aggregator::with_factory(Editable(Arc::clone(&shared)), factory, no_handshake());
        agg.connect().await.unwrap();
        assert_eq!(agg.get_connected_servers().await, vec!["kept", "gone"]);

        *shared.lock().unwrap() = config(&["kept"]);
        agg.connect().await.unwrap();

        assert_eq!(agg.get_connected_servers().await, vec!["kept"]);
        assert!(!agg.is_server_connected("gone").await);
        assert!(!gone_handle.is_connected());
        let tools = agg.list_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].server_name, "kept");
    }

    #[tokio::test]
    async fn test_disconnect_rejects_in_flight_and_clears_registry() {
        let factory = Arc::new(Prepared::default());
        let (t, mut peer) = channel("slow", DEFAULT_REQUEST_TIMEOUT);
        factory.add(t);

        let agg = Arc::new(Aggregator::with_factory(config(&["slow"]), factory, no_handshake()));
        agg.connect().await.unwrap();

        let caller = {
            let agg = Arc::clone(&agg);
            tokio::spawn(async move { agg.call_tool("slow", "sleep", json!({})).await })
        };
        peer.next_request().await.unwrap();

        agg.disconnect().await;
        assert!(caller.await.unwrap().unwrap_err().is_closed());
        assert!(agg.get_connected_servers().await.is_empty());
        assert!(!agg.is_server_connected("slow").await);
        assert!(matches!(
            agg.call_tool("slow", "sleep", json!({})).await,
            Err(McpError::ServerNotFound(_))
        ));

        agg.disconnect().await;
    }

    #[tokio::test]
    async fn test_handshake_runs_before_first_call() {
        let factory = Arc::new(Prepared::default());
        let (t, mut peer) = channel("hs", DEFAULT_REQUEST_TIMEOUT);
        factory.add(t);

        let server = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(text) = peer.recv().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                frames.push(value["method"].as_str().unwrap_or_default().to_string());
                if let Some(id) = value["id"].as_u64() {
                    let result = match value["method"].as_str() {
                        Some("initialize") => json!({"protocolVersion": "2024-11-05"}),
                        _ => tools_reply(&["after-init"]),
                    };
                    peer.respond(id, result).await;
                }
                if frames.len() == 3 {
                    break;
                }
            }
            frames
        });

        let agg = Aggregator::with_factory(config(&["hs"]), factory, AggregatorOptions::default());
        agg.connect().await.unwrap();
        assert_eq!(agg.list_tools().await[0].item.name, "after-init");
        assert_eq!(
            server.await.unwrap(),
            vec!["initialize", "notifications/initialized", "tools/list"]
        );
    }

    #[tokio::test]
    async fn test_failed_handshake_is_connect_failure() {
        let factory = Arc::new(Prepared::default());
        let (t, peer) = channel("picky", DEFAULT_REQUEST_TIMEOUT);
        factory.add(t);
        serve(peer, |_| Some(Err((error_codes::INVALID_REQUEST, "bad version".into()))));

        let agg = Aggregator::with_factory(config(&["picky"]), factory, AggregatorOptions::default());
        let err = agg.connect().await.unwrap_err();
        assert!(matches!(err, McpError::ConnectFailed { ref failures } if failures.len() == 1));
        assert!(!agg.is_server_connected("picky").await);
    }
}
