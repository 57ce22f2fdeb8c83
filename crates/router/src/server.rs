//! Server-side JSON-RPC dispatch for one downstream client session.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    bundler_config::ServerConfig,
    bundler_mcp::types::{
        InitializeResult, JsonRpcNotification, JsonRpcResponse, ListChangedCapability,
        PROTOCOL_VERSION, PromptsGetParams, ResourcesReadParams, ServerCapabilities, ServerInfo,
        ToolsCallParams, ToolsCallResult, error_codes,
    },
    serde_json::{Value, json},
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Result, RouterError},
    router::Router,
    visibility::normalize_client_name,
};

/// Protocol revisions we answer with as-is; anything else gets ours.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[PROTOCOL_VERSION, "2025-03-26", "2025-06-18"];

/// Notifications emitted after the snapshot revision changes.
pub const LIST_CHANGED_NOTIFICATIONS: &[&str] = &[
    "notifications/tools/list_changed",
    "notifications/prompts/list_changed",
    "notifications/resources/list_changed",
];

const META_TOOLS_INSTRUCTIONS: &str = "Tools from every bundled server are reachable through \
    search_capabilities (find a tool by keywords) and call_capability (invoke it by name).";

pub struct McpServer {
    router: Arc<Router>,
    name: String,
    instructions: Option<String>,
    /// Normalized client name from `initialize`.
    client: RwLock<Option<String>>,
    initialized: AtomicBool,
}

impl McpServer {
    pub fn new(router: Arc<Router>, name: impl Into<String>, instructions: Option<String>) -> Self {
        Self {
            router,
            name: name.into(),
            instructions,
            client: RwLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn from_config(router: Arc<Router>, config: &ServerConfig) -> Self {
        Self::new(router, config.name.clone(), config.instructions.clone())
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn client_name(&self) -> Option<String> {
        self.client.read().await.clone()
    }

    /// Whether the client sent `notifications/initialized`.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Handle one raw frame. `None` when nothing should be written back.
    pub async fn handle_frame(&self, frame: &[u8]) -> Option<JsonRpcResponse> {
        match serde_json::from_slice::<Value>(frame) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!(error = %e, "unparseable frame from client");
                Some(JsonRpcResponse::failure(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    format!("parse error: {e}"),
                ))
            },
        }
    }

    pub async fn handle_message(&self, message: Value) -> Option<JsonRpcResponse> {
        let Value::Object(mut object) = message else {
            return Some(JsonRpcResponse::failure(
                Value::Null,
                error_codes::INVALID_REQUEST,
                "expected a JSON-RPC object",
            ));
        };

        let id = object.remove("id").filter(|id| !id.is_null());
        let params = object.remove("params");
        let Some(method) = object.get("method").and_then(Value::as_str) else {
            // A response to something we never send; nothing to answer.
            debug!("ignoring client message without a method");
            return None;
        };

        let Some(id) = id else {
            self.handle_notification(method).await;
            return None;
        };

        Some(match self.handle_request(method, params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(RequestError::MethodNotFound) => JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {method}"),
            ),
            Err(RequestError::Router(e)) => {
                debug!(method = %method, error = %e, "request failed");
                JsonRpcResponse::failure(id, e.code(), e.to_string())
            },
        })
    }

    async fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" => {
                self.initialized.store(true, Ordering::SeqCst);
                debug!("client initialized");
            },
            other => debug!(method = %other, "ignoring client notification"),
        }
    }

    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, RequestError> {
        let client = self.client_name().await;
        let client = client.as_deref();
        let result = match method {
            "initialize" => self.initialize(params.as_ref()).await,
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.router.list_tools(client).await })),
            "tools/call" => self.call_tool(client, params).await,
            "prompts/list" => Ok(json!({ "prompts": self.router.list_prompts(client).await })),
            "prompts/get" => self.get_prompt(client, params).await,
            "resources/list" => Ok(json!({ "resources": self.router.list_resources(client).await })),
            "resources/read" => self.read_resource(client, params).await,
            _ => return Err(RequestError::MethodNotFound),
        };
        result.map_err(RequestError::Router)
    }

    async fn initialize(&self, params: Option<&Value>) -> Result<Value> {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let protocol_version = requested
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(PROTOCOL_VERSION);

        let client_name = params
            .and_then(|p| p.get("clientInfo"))
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .map(normalize_client_name)
            .filter(|name| !name.is_empty());
        info!(client = ?client_name, protocol_version, "client connected");
        *self.client.write().await = client_name;

        let list_changed = || {
            Some(ListChangedCapability {
                list_changed: true,
            })
        };
        let instructions = self.instructions.clone().or_else(|| {
            self.router
                .meta_tools_enabled()
                .then(|| META_TOOLS_INSTRUCTIONS.to_string())
        });
        let result = InitializeResult {
            protocol_version: protocol_version.to_string(),
            capabilities: ServerCapabilities {
                tools: list_changed(),
                resources: list_changed(),
                prompts: list_changed(),
            },
            server_info: ServerInfo {
                name: self.name.clone(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            instructions,
        };
        Ok(serde_json::to_value(result)?)
    }

    /// Routing failures become `isError` results; bad names and arguments
    /// stay protocol errors.
    async fn call_tool(&self, client: Option<&str>, params: Option<Value>) -> Result<Value> {
        let params: ToolsCallParams = parse_params(params)?;
        let result = match self
            .router
            .call_tool(client, &params.name, params.arguments)
            .await
        {
            Ok(result) => result,
            Err(e @ (RouterError::UnknownTarget { .. } | RouterError::InvalidParams(_))) => {
                return Err(e);
            },
            Err(e) => {
                warn!(tool = %params.name, error = %e, "tool call failed");
                ToolsCallResult::error(e.to_string())
            },
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn get_prompt(&self, client: Option<&str>, params: Option<Value>) -> Result<Value> {
        let params: PromptsGetParams = parse_params(params)?;
        let result = self
            .router
            .get_prompt(client, &params.name, params.arguments)
            .await?;
        Ok(serde_json::to_value(result)?)
    }

    async fn read_resource(&self, client: Option<&str>, params: Option<Value>) -> Result<Value> {
        let params: ResourcesReadParams = parse_params(params)?;
        let result = self.router.read_resource(client, &params.uri).await?;
        Ok(serde_json::to_value(result)?)
    }
}

enum RequestError {
    MethodNotFound,
    Router(RouterError),
}

fn parse_params<T: for<'de> serde::Deserialize<'de>>(params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| RouterError::InvalidParams(e.to_string()))
}

/// The three `list_changed` notifications, serialized.
pub fn list_changed_frames() -> Vec<Vec<u8>> {
    LIST_CHANGED_NOTIFICATIONS
        .iter()
        .filter_map(|method| serde_json::to_vec(&JsonRpcNotification::new(method, None)).ok())
        .collect()
}
