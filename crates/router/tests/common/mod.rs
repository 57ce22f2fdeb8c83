//! Fake upstreams shared by the router integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    async_trait::async_trait,
    bundler_catalog::{Project, SnapshotCache},
    bundler_mcp::{
        Connector, Error, LifecycleError, LifecycleSettings, McpClientState, McpClientTrait,
        McpTransportError, NoCredentials, Result, UpstreamDescriptor, UpstreamManager,
        types::{
            McpPromptDef, McpResourceDef, McpToolDef, PromptsGetResult, ResourceContents,
            ResourcesReadResult, ToolsCallResult,
        },
    },
    bundler_router::{Router, RouterSettings},
    serde_json::Value,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A scripted failure for the next call against an alias.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Error text the router treats as a dead session.
    StaleSession,
    /// I/O failure of the connection itself.
    Disconnected,
    /// An ordinary JSON-RPC error from the upstream.
    Rpc,
}

/// What one fake upstream advertises.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    pub tools: Vec<McpToolDef>,
    pub prompts: Option<Vec<McpPromptDef>>,
    pub resources: Option<Vec<McpResourceDef>>,
    /// Size of the text returned by the `dump` tool.
    pub dump_bytes: usize,
}

impl FakeServer {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| McpToolDef::named(*n)).collect(),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Shared {
    servers: Mutex<HashMap<String, FakeServer>>,
    failures: Mutex<HashMap<String, VecDeque<Failure>>>,
    connects: Mutex<HashMap<String, usize>>,
    refused: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, String, Value)>>,
}

#[derive(Default)]
pub struct FakeConnector {
    shared: Arc<Shared>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, alias: &str, server: FakeServer) {
        lock(&self.shared.servers).insert(alias.to_string(), server);
    }

    pub fn fail_next(&self, alias: &str, failure: Failure) {
        lock(&self.shared.failures)
            .entry(alias.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Make every connect for `alias` fail until [`FakeConnector::accept`].
    pub fn refuse(&self, alias: &str) {
        lock(&self.shared.refused).insert(alias.to_string());
    }

    pub fn accept(&self, alias: &str) {
        lock(&self.shared.refused).remove(alias);
    }

    pub fn connects(&self, alias: &str) -> usize {
        lock(&self.shared.connects).get(alias).copied().unwrap_or(0)
    }

    /// `(alias, original tool name, arguments)` of every successful call.
    pub fn calls(&self) -> Vec<(String, String, Value)> {
        lock(&self.shared.calls).clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, descriptor: &UpstreamDescriptor) -> Result<Arc<dyn McpClientTrait>> {
        let alias = descriptor.alias.clone();
        *lock(&self.shared.connects).entry(alias.clone()).or_default() += 1;
        if lock(&self.shared.refused).contains(&alias) {
            return Err(LifecycleError::Connection {
                alias,
                reason: "connection refused".into(),
            }
            .into());
        }
        Ok(Arc::new(FakeClient {
            alias,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeClient {
    alias: String,
    shared: Arc<Shared>,
}

impl FakeClient {
    fn server(&self) -> FakeServer {
        lock(&self.shared.servers)
            .get(&self.alias)
            .cloned()
            .unwrap_or_default()
    }

    fn scripted_failure(&self) -> Option<Error> {
        let failure = lock(&self.shared.failures)
            .get_mut(&self.alias)
            .and_then(VecDeque::pop_front)?;
        Some(match failure {
            Failure::StaleSession => Error::message("Session not found"),
            Failure::Disconnected => Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream hung up",
            )),
            Failure::Rpc => McpTransportError::Rpc {
                method: "tools/call".into(),
                code: -32000,
                message: "rate limited".into(),
            }
            .into(),
        })
    }
}

#[async_trait]
impl McpClientTrait for FakeClient {
    fn server_name(&self) -> &str {
        &self.alias
    }

    fn state(&self) -> McpClientState {
        McpClientState::Ready
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        Ok(self.server().tools)
    }

    async fn list_prompts(&self) -> Result<Option<Vec<McpPromptDef>>> {
        Ok(self.server().prompts)
    }

    async fn list_resources(&self) -> Result<Option<Vec<McpResourceDef>>> {
        Ok(self.server().resources)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolsCallResult> {
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        lock(&self.shared.calls).push((self.alias.clone(), name.to_string(), arguments.clone()));
        if name == "dump" {
            return Ok(ToolsCallResult::text("x".repeat(self.server().dump_bytes)));
        }
        Ok(ToolsCallResult::text(format!("{}:{name}:{arguments}", self.alias)))
    }

    async fn get_prompt(&self, name: &str, _arguments: Option<Value>) -> Result<PromptsGetResult> {
        Ok(PromptsGetResult {
            description: Some(format!("{}:{name}", self.alias)),
            messages: Vec::new(),
        })
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourcesReadResult> {
        Ok(ResourcesReadResult {
            contents: vec![ResourceContents {
                uri: uri.to_string(),
                mime_type: Some("text/plain".into()),
                text: Some(format!("{}:{uri}", self.alias)),
                blob: None,
            }],
        })
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn shutdown(&self) {}
}

pub fn local(alias: &str) -> UpstreamDescriptor {
    UpstreamDescriptor::local(alias, format!("{alias}-mcp"))
}

pub fn manager(connector: &Arc<FakeConnector>) -> Arc<UpstreamManager> {
    let settings = LifecycleSettings {
        ready_timeout: Duration::from_secs(2),
        backoff: vec![Duration::from_millis(10)],
        credentials: Arc::new(NoCredentials),
    };
    Arc::new(UpstreamManager::new(
        Arc::clone(connector) as Arc<dyn Connector>,
        settings,
    ))
}

/// A started router over `aliases`, all served by `connector`.
pub async fn started_router(
    connector: &Arc<FakeConnector>,
    aliases: &[&str],
    settings: RouterSettings,
) -> Arc<Router> {
    let project = Project::new("Demo Project", aliases.iter().map(|a| local(a)).collect());
    let router = Arc::new(Router::new(
        project,
        manager(connector),
        SnapshotCache::in_memory(),
        settings,
    ));
    router.start().await.expect("router starts");
    router
}

pub fn tool_names(tools: &[McpToolDef]) -> Vec<&str> {
    tools.iter().map(|t| t.name.as_str()).collect()
}
