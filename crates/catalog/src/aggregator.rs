//! Capability aggregation: raw per-upstream lists in, one [`Snapshot`] out.
//!
//! Pure and infallible. Inputs are scanned in the order given (registration
//! order); a later upstream that namespaces to an existing key replaces the
//! earlier entry and an [`IntegrityWarning`] is recorded.

use std::collections::BTreeMap;

use {
    bundler_mcp::UpstreamDescriptor,
    serde::Serialize,
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use {bundler_common::definitions::snapshot as snapshot_metrics, metrics::counter};

use crate::{
    namespace::{namespace_prompt, namespace_tool, wrap_resource_uri},
    provider::RawCapabilitySet,
    snapshot::{NamespacedPrompt, NamespacedResource, NamespacedTool, Snapshot, Target},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

/// A namespaced key produced by more than one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityWarning {
    pub kind: CapabilityKind,
    pub key: String,
    pub replaced_alias: String,
    pub winning_alias: String,
}

impl std::fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "duplicate {:?} '{}': '{}' replaced '{}'",
            self.kind, self.key, self.winning_alias, self.replaced_alias
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub snapshot: Snapshot,
    pub warnings: Vec<IntegrityWarning>,
}

fn record_collision(
    warnings: &mut Vec<IntegrityWarning>,
    kind: CapabilityKind,
    key: &str,
    replaced_alias: &str,
    winning_alias: &str,
) {
    warn!(
        kind = ?kind,
        key = %key,
        replaced = %replaced_alias,
        winner = %winning_alias,
        "duplicate namespaced capability, last registration wins"
    );
    #[cfg(feature = "metrics")]
    counter!(snapshot_metrics::INTEGRITY_WARNINGS_TOTAL).increment(1);
    warnings.push(IntegrityWarning {
        kind,
        key: key.to_string(),
        replaced_alias: replaced_alias.to_string(),
        winning_alias: winning_alias.to_string(),
    });
}

/// Build a snapshot from already-fetched capabilities.
pub fn build_snapshot(inputs: &[(UpstreamDescriptor, RawCapabilitySet)]) -> Aggregation {
    let mut warnings = Vec::new();
    let mut tools: BTreeMap<String, NamespacedTool> = BTreeMap::new();
    let mut prompts: BTreeMap<String, NamespacedPrompt> = BTreeMap::new();
    let mut resources: BTreeMap<String, NamespacedResource> = BTreeMap::new();

    for (upstream, raw) in inputs {
        let alias = upstream.alias.as_str();
        if raw.is_empty() {
            debug!(alias = %alias, "skipping upstream with no capabilities");
            continue;
        }

        for tool in &raw.tools {
            if !upstream.includes_tool(&tool.name) {
                continue;
            }
            let key = namespace_tool(alias, &tool.name);
            let entry = NamespacedTool {
                namespaced: key.clone(),
                alias: alias.to_string(),
                definition: tool.clone(),
            };
            if let Some(previous) = tools.insert(key.clone(), entry) {
                record_collision(&mut warnings, CapabilityKind::Tool, &key, &previous.alias, alias);
            }
        }

        for prompt in raw.prompts.iter().flatten() {
            let key = namespace_prompt(alias, &prompt.name);
            let entry = NamespacedPrompt {
                namespaced: key.clone(),
                alias: alias.to_string(),
                definition: prompt.clone(),
            };
            if let Some(previous) = prompts.insert(key.clone(), entry) {
                record_collision(&mut warnings, CapabilityKind::Prompt, &key, &previous.alias, alias);
            }
        }

        for resource in raw.resources.iter().flatten() {
            let key = wrap_resource_uri(alias, &resource.uri);
            let entry = NamespacedResource {
                uri: key.clone(),
                alias: alias.to_string(),
                definition: resource.clone(),
            };
            if let Some(previous) = resources.insert(key.clone(), entry) {
                record_collision(
                    &mut warnings,
                    CapabilityKind::Resource,
                    &key,
                    &previous.alias,
                    alias,
                );
            }
        }
    }

    let tool_map = tools
        .values()
        .map(|t| {
            (t.namespaced.clone(), Target {
                alias: t.alias.clone(),
                original: t.definition.name.clone(),
            })
        })
        .collect();
    let prompt_map = prompts
        .values()
        .map(|p| {
            (p.namespaced.clone(), Target {
                alias: p.alias.clone(),
                original: p.definition.name.clone(),
            })
        })
        .collect();
    let resource_map = resources
        .values()
        .map(|r| {
            (r.uri.clone(), Target {
                alias: r.alias.clone(),
                original: r.definition.uri.clone(),
            })
        })
        .collect();

    Aggregation {
        snapshot: Snapshot {
            tools: tools.into_values().collect(),
            prompts: prompts.into_values().collect(),
            resources: resources.into_values().collect(),
            tool_map,
            prompt_map,
            resource_map,
        },
        warnings,
    }
}
