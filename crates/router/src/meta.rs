//! Bundler-owned tools: capability search, call-by-name, and the
//! large-response fetcher.

use {
    bundler_catalog::{NamespacedTool, Snapshot},
    bundler_mcp::types::McpToolDef,
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
};

use crate::error::{Result, RouterError};

pub const SEARCH_TOOL: &str = "search_capabilities";
pub const CALL_TOOL: &str = "call_capability";
pub const FETCH_TOOL: &str = "fetch_large_response";

pub fn is_bundler_tool(name: &str) -> bool {
    matches!(name, SEARCH_TOOL | CALL_TOOL | FETCH_TOOL)
}

pub fn search_tool_def() -> McpToolDef {
    McpToolDef {
        name: SEARCH_TOOL.into(),
        title: Some("Search capabilities".into()),
        description: Some(
            "Find tools across every bundled server. Each whitespace-separated token must \
             match the tool name, server alias, title or description (case-insensitive). \
             An empty query lists everything."
                .into(),
        ),
        input_schema: Some(json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search tokens, e.g. \"stripe refund\"" },
                "limit": { "type": "integer", "minimum": 1 }
            }
        })),
        annotations: Some(json!({ "readOnlyHint": true })),
    }
}

pub fn call_tool_def() -> McpToolDef {
    McpToolDef {
        name: CALL_TOOL.into(),
        title: Some("Call capability".into()),
        description: Some(
            "Call a bundled tool by its namespaced name as returned by search_capabilities."
                .into(),
        ),
        input_schema: Some(json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "arguments": { "type": "object" }
            },
            "required": ["name"]
        })),
        annotations: None,
    }
}

pub fn fetch_tool_def() -> McpToolDef {
    McpToolDef {
        name: FETCH_TOOL.into(),
        title: Some("Fetch large response".into()),
        description: Some(
            "Read a response that was too large to return inline. Pass the path from the \
             pointer message; use offset/length (bytes) to read it in chunks."
                .into(),
        ),
        input_schema: Some(json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "offset": { "type": "integer", "minimum": 0 },
                "length": { "type": "integer", "minimum": 1 }
            },
            "required": ["path"]
        })),
        annotations: Some(json!({ "readOnlyHint": true })),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchArgs {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CallArgs {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
pub struct FetchArgs {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub length: Option<u64>,
}

/// Deserialize tool arguments, treating a missing object as `{}`.
pub fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, arguments: Value) -> Result<T> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|e| RouterError::InvalidParams(format!("{tool}: {e}")))
}

/// One search hit as returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub name: String,
    pub alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl From<&NamespacedTool> for SearchHit {
    fn from(tool: &NamespacedTool) -> Self {
        Self {
            name: tool.namespaced.clone(),
            alias: tool.alias.clone(),
            title: tool.definition.title.clone(),
            description: tool.definition.description.clone(),
            input_schema: tool.definition.input_schema.clone(),
        }
    }
}

fn matches_token(tool: &NamespacedTool, token: &str) -> bool {
    let fields = [
        Some(tool.namespaced.as_str()),
        Some(tool.alias.as_str()),
        tool.definition.title.as_deref(),
        tool.definition.description.as_deref(),
    ];
    fields
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(token))
}

/// AND across whitespace-separated tokens, each a case-insensitive substring
/// of at least one field. Results keep snapshot order.
pub fn search<'a>(
    snapshot: &'a Snapshot,
    query: &str,
    visible: impl Fn(&NamespacedTool) -> bool,
) -> Vec<&'a NamespacedTool> {
    let tokens: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    snapshot
        .tools
        .iter()
        .filter(|tool| visible(tool))
        .filter(|tool| tokens.iter().all(|token| matches_token(tool, token)))
        .collect()
}
