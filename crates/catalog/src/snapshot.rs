//! The immutable, namespaced view of every upstream's capabilities.

use std::collections::BTreeMap;

use {
    bundler_mcp::types::{McpPromptDef, McpResourceDef, McpToolDef},
    serde::{Deserialize, Serialize},
};

/// Where a namespaced name or wrapped URI points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub alias: String,
    /// Original tool/prompt name, or original resource URI.
    pub original: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespacedTool {
    pub namespaced: String,
    pub alias: String,
    /// Upstream definition, with its original name.
    pub definition: McpToolDef,
}

impl NamespacedTool {
    /// The definition as exposed downstream.
    pub fn exposed(&self) -> McpToolDef {
        McpToolDef {
            name: self.namespaced.clone(),
            ..self.definition.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespacedPrompt {
    pub namespaced: String,
    pub alias: String,
    pub definition: McpPromptDef,
}

impl NamespacedPrompt {
    pub fn exposed(&self) -> McpPromptDef {
        McpPromptDef {
            name: self.namespaced.clone(),
            ..self.definition.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespacedResource {
    /// Wrapped `mcp-bundler://` URI.
    pub uri: String,
    pub alias: String,
    pub definition: McpResourceDef,
}

impl NamespacedResource {
    pub fn exposed(&self) -> McpResourceDef {
        McpResourceDef {
            uri: self.uri.clone(),
            ..self.definition.clone()
        }
    }
}

/// Sorted capability lists plus reverse maps back to `(alias, original)`.
///
/// Built by the aggregator and replaced wholesale on rebuild.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tools: Vec<NamespacedTool>,
    pub prompts: Vec<NamespacedPrompt>,
    pub resources: Vec<NamespacedResource>,
    pub tool_map: BTreeMap<String, Target>,
    pub prompt_map: BTreeMap<String, Target>,
    pub resource_map: BTreeMap<String, Target>,
}

impl Snapshot {
    pub fn resolve_tool(&self, namespaced: &str) -> Option<&Target> {
        self.tool_map.get(namespaced)
    }

    pub fn resolve_prompt(&self, namespaced: &str) -> Option<&Target> {
        self.prompt_map.get(namespaced)
    }

    pub fn resolve_resource(&self, uri: &str) -> Option<&Target> {
        self.resource_map.get(uri)
    }

    pub fn tool(&self, namespaced: &str) -> Option<&NamespacedTool> {
        self.tools
            .binary_search_by(|t| t.namespaced.as_str().cmp(namespaced))
            .ok()
            .map(|idx| &self.tools[idx])
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.prompts.is_empty() && self.resources.is_empty()
    }

    pub fn tool_count_for(&self, alias: &str) -> usize {
        self.tools.iter().filter(|t| t.alias == alias).count()
    }

    /// Every list entry has exactly one map entry and vice versa.
    pub fn is_consistent(&self) -> bool {
        let tools = self.tools.len() == self.tool_map.len()
            && self.tools.iter().all(|t| {
                self.tool_map
                    .get(&t.namespaced)
                    .is_some_and(|target| target.alias == t.alias && target.original == t.definition.name)
            });
        let prompts = self.prompts.len() == self.prompt_map.len()
            && self.prompts.iter().all(|p| {
                self.prompt_map
                    .get(&p.namespaced)
                    .is_some_and(|target| target.alias == p.alias && target.original == p.definition.name)
            });
        let resources = self.resources.len() == self.resource_map.len()
            && self.resources.iter().all(|r| {
                self.resource_map
                    .get(&r.uri)
                    .is_some_and(|target| target.alias == r.alias && target.original == r.definition.uri)
            });
        tools && prompts && resources
    }
}
