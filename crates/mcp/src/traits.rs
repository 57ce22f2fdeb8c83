//! Trait abstractions for the MCP transport and client layers.
//!
//! The lifecycle manager and the router only ever hold `Arc<dyn McpClientTrait>`,
//! so tests can substitute scripted clients for real child processes.

use {async_trait::async_trait, serde_json::Value};

use crate::{
    client::McpClientState,
    error::{Error, Result},
    types::{
        InitializeResult, JsonRpcResponse, McpPromptDef, McpResourceDef, McpToolDef,
        PromptsGetResult, ResourcesReadResult, ToolsCallResult,
    },
};

/// Transport layer for MCP communication (JSON-RPC).
///
/// `StdioTransport` implements this over stdin/stdout of a child process,
/// `HttpTransport` over streamable HTTP.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Check if the underlying connection/process is still alive.
    async fn is_alive(&self) -> bool;

    /// Close the underlying connection/process.
    async fn kill(&self);
}

/// Client-level abstraction for one upstream connection.
///
/// All methods take `&self` so a single ready connection can serve
/// concurrent calls; the transport matches responses by request id.
#[async_trait]
pub trait McpClientTrait: Send + Sync {
    /// The alias this connection was opened for.
    fn server_name(&self) -> &str;

    /// Current connection state.
    fn state(&self) -> McpClientState;

    /// Handshake result, if the handshake has completed.
    fn server_info(&self) -> Option<&InitializeResult> {
        None
    }

    /// Fetch every tool, following pagination cursors.
    async fn list_tools(&self) -> Result<Vec<McpToolDef>>;

    /// `None` when the upstream does not advertise prompts.
    async fn list_prompts(&self) -> Result<Option<Vec<McpPromptDef>>> {
        Ok(None)
    }

    /// `None` when the upstream does not advertise resources.
    async fn list_resources(&self) -> Result<Option<Vec<McpResourceDef>>> {
        Ok(None)
    }

    /// Call a tool on the upstream by its original name.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolsCallResult>;

    async fn get_prompt(&self, name: &str, _arguments: Option<Value>) -> Result<PromptsGetResult> {
        Err(Error::message(format!(
            "upstream '{}' does not serve prompt '{name}'",
            self.server_name()
        )))
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourcesReadResult> {
        Err(Error::message(format!(
            "upstream '{}' does not serve resource '{uri}'",
            self.server_name()
        )))
    }

    /// Check if the server process/connection is still alive.
    async fn is_alive(&self) -> bool;

    /// Shut down the server connection.
    async fn shutdown(&self);
}
