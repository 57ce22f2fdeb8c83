//! Stale-session detection and the set of aliases being restarted.

use std::collections::BTreeSet;

use tokio::sync::Mutex;

/// Error text fragments that mean the upstream session is gone and one
/// reconnect-and-retry is worth trying. Matched case-insensitively.
pub const STALE_SESSION_SIGNATURES: &[&str] = &[
    "session not found",
    "unknown session",
    "session expired",
    "invalid session",
    "broken pipe",
    "connection reset",
    "transport closed",
];

pub fn is_stale_session(message: &str) -> bool {
    let lower = message.to_lowercase();
    STALE_SESSION_SIGNATURES
        .iter()
        .any(|signature| lower.contains(signature))
}

/// Aliases whose connection is being torn down or rebuilt. Calls that fail
/// to reach such an alias get a "restarting" error instead of a generic one.
#[derive(Debug, Default)]
pub struct RestartTracker {
    aliases: Mutex<BTreeSet<String>>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark(&self, alias: &str) {
        self.aliases.lock().await.insert(alias.to_string());
    }

    /// Returns whether the alias was marked.
    pub async fn clear(&self, alias: &str) -> bool {
        self.aliases.lock().await.remove(alias)
    }

    pub async fn is_restarting(&self, alias: &str) -> bool {
        self.aliases.lock().await.contains(alias)
    }

    pub async fn aliases(&self) -> Vec<String> {
        self.aliases.lock().await.iter().cloned().collect()
    }
}
