//! Raw capability input and the provider seam that fetches it.

use {
    async_trait::async_trait,
    bundler_mcp::{
        UpstreamDescriptor,
        types::{McpPromptDef, McpResourceDef, McpToolDef},
    },
    serde::{Deserialize, Serialize},
};

use crate::error::Result;

/// Everything one upstream advertises, as fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCapabilitySet {
    pub tools: Vec<McpToolDef>,
    /// `None` when the upstream does not serve prompts at all.
    pub prompts: Option<Vec<McpPromptDef>>,
    pub resources: Option<Vec<McpResourceDef>>,
}

impl RawCapabilitySet {
    pub fn with_tools(tools: Vec<McpToolDef>) -> Self {
        Self {
            tools,
            ..Self::default()
        }
    }

    /// No tools, prompts or resources.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
            && self.prompts.as_ref().is_none_or(Vec::is_empty)
            && self.resources.as_ref().is_none_or(Vec::is_empty)
    }
}

/// Pulls capabilities from an upstream. Failures are per upstream.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn fetch_capabilities(&self, upstream: &UpstreamDescriptor) -> Result<RawCapabilitySet>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emptiness_ignores_absent_lists() {
        assert!(RawCapabilitySet::default().is_empty());
        let with_empty_prompts = RawCapabilitySet {
            prompts: Some(Vec::new()),
            ..Default::default()
        };
        assert!(with_empty_prompts.is_empty());
        assert!(!RawCapabilitySet::with_tools(vec![McpToolDef::named("x")]).is_empty());
    }
}
