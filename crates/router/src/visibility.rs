//! Per-client alias hiding.

use std::collections::{HashMap, HashSet};

use bundler_config::VisibilityRule;

/// Lowercase, ASCII alphanumerics only. `"Claude Desktop"` and
/// `"claude-desktop"` both become `"claudedesktop"`.
pub fn normalize_client_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct VisibilityPolicy {
    /// Normalized client name -> hidden aliases.
    hidden: HashMap<String, HashSet<String>>,
}

impl VisibilityPolicy {
    pub fn from_rules(rules: &[VisibilityRule]) -> Self {
        let mut hidden: HashMap<String, HashSet<String>> = HashMap::new();
        for rule in rules {
            let client = normalize_client_name(&rule.client);
            if client.is_empty() {
                continue;
            }
            hidden
                .entry(client)
                .or_default()
                .extend(rule.hide_aliases.iter().cloned());
        }
        Self { hidden }
    }

    pub fn is_empty(&self) -> bool {
        self.hidden.is_empty()
    }

    /// `client` must already be normalized. Unknown clients see everything.
    pub fn is_hidden(&self, client: Option<&str>, alias: &str) -> bool {
        client
            .and_then(|c| self.hidden.get(c))
            .is_some_and(|aliases| aliases.contains(alias))
    }
}
