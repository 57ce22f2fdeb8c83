//! MCP client: runs the handshake and capability queries against one upstream.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use {
    serde::de::DeserializeOwned,
    tracing::{debug, info, warn},
};

use crate::{
    credentials::SharedCredentialResolver,
    error::{Context, Error, Result},
    http_transport::HttpTransport,
    traits::{McpClientTrait, McpTransport},
    transport::{SpawnSpec, StdioTransport},
    types::{
        ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, McpPromptDef,
        McpResourceDef, McpToolDef, PROTOCOL_VERSION, PromptsGetParams, PromptsGetResult,
        PromptsListResult, ResourcesListResult, ResourcesReadParams, ResourcesReadResult,
        ToolsCallParams, ToolsCallResult, ToolsListResult,
    },
};

/// Upper bound on pages fetched for one list call.
const MAX_LIST_PAGES: usize = 64;

/// State of an MCP client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpClientState {
    /// Transport open, handshake not finished.
    Connected,
    /// `initialize` completed, `initialized` notification sent.
    Ready,
    /// Connection shut down or lost.
    Closed,
}

impl McpClientState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Connected => 0,
            Self::Ready => 1,
            Self::Closed => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connected,
            1 => Self::Ready,
            _ => Self::Closed,
        }
    }
}

/// An initialized connection to a single upstream.
pub struct McpClient {
    server_name: String,
    transport: Arc<dyn McpTransport>,
    state: AtomicU8,
    server_info: InitializeResult,
}

impl McpClient {
    /// Spawn a local upstream and run the handshake.
    pub async fn connect_stdio(
        alias: &str,
        spec: SpawnSpec<'_>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let transport = StdioTransport::spawn(spec, request_timeout).await?;
        Self::handshake(alias, transport).await
    }

    /// Open a streamable HTTP session and run the handshake.
    pub async fn connect_http(
        alias: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        request_timeout: Duration,
        credentials: Option<SharedCredentialResolver>,
    ) -> Result<Self> {
        info!(alias = %alias, url = %url, "connecting to upstream over http");
        let transport: Arc<dyn McpTransport> = match credentials {
            Some(creds) => {
                HttpTransport::with_credentials(alias, url, headers, request_timeout, creds)?
            },
            None => HttpTransport::new(alias, url, headers, request_timeout)?,
        };
        Self::handshake(alias, transport).await
    }

    /// Run `initialize` + `notifications/initialized` over an open transport.
    ///
    /// The transport is killed if the handshake fails, so a half-open child
    /// process never outlives the attempt.
    pub async fn handshake(alias: &str, transport: Arc<dyn McpTransport>) -> Result<Self> {
        match Self::initialize(alias, transport.as_ref()).await {
            Ok(server_info) => Ok(Self {
                server_name: alias.to_string(),
                transport,
                state: AtomicU8::new(McpClientState::Ready.as_u8()),
                server_info,
            }),
            Err(e) => {
                warn!(alias = %alias, error = %e, "upstream initialize handshake failed");
                transport.kill().await;
                Err(e)
            },
        }
    }

    async fn initialize(alias: &str, transport: &dyn McpTransport) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "mcp-bundler".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let resp = transport
            .request("initialize", Some(serde_json::to_value(&params)?))
            .await?;
        let result: InitializeResult =
            serde_json::from_value(resp.result.context("initialize returned no result")?)?;

        info!(
            alias = %alias,
            protocol = %result.protocol_version,
            server_name = %result.server_info.name,
            "upstream initialized"
        );

        transport.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = self.state();
        if state != McpClientState::Ready {
            return Err(Error::message(format!(
                "client for '{}' is not ready (state: {state:?})",
                self.server_name
            )));
        }
        Ok(())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<T> {
        self.ensure_ready()?;
        let resp = self.transport.request(method, params).await?;
        let result = resp
            .result
            .with_context(|| format!("{method} returned no result"))?;
        Ok(serde_json::from_value(result)?)
    }

    /// Follow `nextCursor` until exhausted.
    async fn collect_pages<P, T>(
        &self,
        method: &str,
        split: impl Fn(P) -> (Vec<T>, Option<String>),
    ) -> Result<Vec<T>>
    where
        P: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = HashSet::new();

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let page: P = self.call(method, params).await?;
            let (mut batch, next) = split(page);
            items.append(&mut batch);

            match next {
                Some(next) if seen_cursors.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!(
                        alias = %self.server_name,
                        method = %method,
                        cursor = %next,
                        "upstream repeated a pagination cursor, stopping"
                    );
                    break;
                },
                None => break,
            }
        }

        debug!(alias = %self.server_name, method = %method, count = items.len(), "listed upstream items");
        Ok(items)
    }
}

#[async_trait::async_trait]
impl McpClientTrait for McpClient {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn state(&self) -> McpClientState {
        McpClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn server_info(&self) -> Option<&InitializeResult> {
        Some(&self.server_info)
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        self.collect_pages("tools/list", |page: ToolsListResult| {
            (page.tools, page.next_cursor)
        })
        .await
    }

    async fn list_prompts(&self) -> Result<Option<Vec<McpPromptDef>>> {
        if self.server_info.capabilities.prompts.is_none() {
            return Ok(None);
        }
        let prompts = self
            .collect_pages("prompts/list", |page: PromptsListResult| {
                (page.prompts, page.next_cursor)
            })
            .await?;
        Ok(Some(prompts))
    }

    async fn list_resources(&self) -> Result<Option<Vec<McpResourceDef>>> {
        if self.server_info.capabilities.resources.is_none() {
            return Ok(None);
        }
        let resources = self
            .collect_pages("resources/list", |page: ResourcesListResult| {
                (page.resources, page.next_cursor)
            })
            .await?;
        Ok(Some(resources))
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<ToolsCallResult> {
        let params = ToolsCallParams {
            name: name.into(),
            arguments,
        };
        self.call("tools/call", Some(serde_json::to_value(&params)?))
            .await
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<PromptsGetResult> {
        let params = PromptsGetParams {
            name: name.into(),
            arguments,
        };
        self.call("prompts/get", Some(serde_json::to_value(&params)?))
            .await
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourcesReadResult> {
        let params = ResourcesReadParams { uri: uri.into() };
        self.call("resources/read", Some(serde_json::to_value(&params)?))
            .await
    }

    async fn is_alive(&self) -> bool {
        self.state() == McpClientState::Ready && self.transport.is_alive().await
    }

    async fn shutdown(&self) {
        let previous = self
            .state
            .swap(McpClientState::Closed.as_u8(), Ordering::SeqCst);
        if McpClientState::from_u8(previous) != McpClientState::Closed {
            self.transport.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use {
        super::*,
        crate::types::JsonRpcResponse,
        serde_json::{Value, json},
        tokio::sync::Mutex,
    };

    /// Answers each method from a fixed table; `tools/list` is paginated.
    struct ScriptedTransport {
        capabilities: Value,
        requests: Mutex<Vec<(String, Option<Value>)>>,
        kills: AtomicUsize,
        fail_initialize: bool,
    }

    impl ScriptedTransport {
        fn new(capabilities: Value) -> Arc<Self> {
            Arc::new(Self {
                capabilities,
                requests: Mutex::new(Vec::new()),
                kills: AtomicUsize::new(0),
                fail_initialize: false,
            })
        }
    }

    #[async_trait::async_trait]
    impl McpTransport for ScriptedTransport {
        async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
            self.requests
                .lock()
                .await
                .push((method.to_string(), params.clone()));
            let result = match method {
                "initialize" if self.fail_initialize => {
                    return Err(Error::message("handshake refused"));
                },
                "initialize" => json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": self.capabilities,
                    "serverInfo": { "name": "scripted" }
                }),
                "tools/list" => match params.as_ref().and_then(|p| p.get("cursor")) {
                    None => json!({ "tools": [{ "name": "a" }], "nextCursor": "page-2" }),
                    Some(_) => json!({ "tools": [{ "name": "b" }] }),
                },
                "prompts/list" => json!({ "prompts": [{ "name": "greet" }] }),
                "resources/list" => json!({ "resources": [{ "uri": "file:///x", "name": "x" }] }),
                "tools/call" => json!({ "content": [{ "type": "text", "text": "done" }] }),
                _ => return Err(Error::message(format!("unexpected method {method}"))),
            };
            Ok(JsonRpcResponse::success(json!(1), result))
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
            Ok(())
        }

        async fn is_alive(&self) -> bool {
            true
        }

        async fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn state_roundtrips_through_u8() {
        for state in [
            McpClientState::Connected,
            McpClientState::Ready,
            McpClientState::Closed,
        ] {
            assert_eq!(McpClientState::from_u8(state.as_u8()), state);
        }
    }

    #[tokio::test]
    async fn list_tools_follows_cursor() {
        let transport = ScriptedTransport::new(json!({ "tools": {} }));
        let client = McpClient::handshake("alpha", transport.clone())
            .await
            .unwrap();
        let tools = client.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);

        let requests = transport.requests.lock().await;
        assert_eq!(requests.last().unwrap().1, Some(json!({ "cursor": "page-2" })));
    }

    #[tokio::test]
    async fn prompts_and_resources_are_capability_gated() {
        let bare = ScriptedTransport::new(json!({ "tools": {} }));
        let client = McpClient::handshake("bare", bare.clone()).await.unwrap();
        assert!(client.list_prompts().await.unwrap().is_none());
        assert!(client.list_resources().await.unwrap().is_none());
        assert!(
            !bare
                .requests
                .lock()
                .await
                .iter()
                .any(|(m, _)| m == "prompts/list")
        );

        let full = ScriptedTransport::new(json!({ "tools": {}, "prompts": {}, "resources": {} }));
        let client = McpClient::handshake("full", full).await.unwrap();
        assert_eq!(client.list_prompts().await.unwrap().unwrap().len(), 1);
        assert_eq!(client.list_resources().await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_handshake_kills_transport() {
        let transport = Arc::new(ScriptedTransport {
            capabilities: json!({}),
            requests: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
            fail_initialize: true,
        });
        assert!(McpClient::handshake("x", transport.clone()).await.is_err());
        assert_eq!(transport.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_once_and_blocks_calls() {
        let transport = ScriptedTransport::new(json!({}));
        let client = McpClient::handshake("x", transport.clone()).await.unwrap();
        assert_eq!(
            client
                .call_tool("a", json!({}))
                .await
                .unwrap()
                .joined_text(),
            "done"
        );

        client.shutdown().await;
        client.shutdown().await;
        assert_eq!(transport.kills.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), McpClientState::Closed);
        assert!(client.call_tool("a", json!({})).await.is_err());
        assert!(!client.is_alive().await);
    }
}
