//! Capability provider backed by live upstream connections.

use std::sync::Arc;

use {
    async_trait::async_trait,
    bundler_catalog::{CapabilityProvider, RawCapabilitySet},
    bundler_mcp::{UpstreamDescriptor, UpstreamManager},
    tracing::debug,
};

pub struct LiveCapabilityProvider {
    upstreams: Arc<UpstreamManager>,
}

impl LiveCapabilityProvider {
    pub fn new(upstreams: Arc<UpstreamManager>) -> Self {
        Self { upstreams }
    }
}

#[async_trait]
impl CapabilityProvider for LiveCapabilityProvider {
    async fn fetch_capabilities(
        &self,
        upstream: &UpstreamDescriptor,
    ) -> bundler_catalog::Result<RawCapabilitySet> {
        let lifecycle = self
            .upstreams
            .lifecycle(&upstream.alias)
            .await
            .map_err(bundler_mcp::Error::from)?;
        let client = lifecycle
            .connection()
            .await
            .map_err(bundler_mcp::Error::from)?;

        let listed = async {
            let tools = client.list_tools().await?;
            let prompts = client.list_prompts().await?;
            let resources = client.list_resources().await?;
            Ok::<_, bundler_mcp::Error>(RawCapabilitySet {
                tools,
                prompts,
                resources,
            })
        }
        .await;

        match listed {
            Ok(raw) => {
                debug!(
                    alias = %upstream.alias,
                    tools = raw.tools.len(),
                    "fetched upstream capabilities"
                );
                Ok(raw)
            },
            Err(e) => {
                if e.is_connection_failure() {
                    lifecycle.report_failure().await;
                }
                Err(e.into())
            },
        }
    }
}
