//! Bearer credentials for remote upstreams.
//!
//! Token discovery and refresh live outside the bundler; transports and the
//! lifecycle manager only consume these three operations.

use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    tokio::sync::RwLock,
    tracing::debug,
};

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Current access token for `alias`, if one is available.
    async fn resolve_token(&self, alias: &str) -> Option<Secret<String>>;

    /// The upstream rejected the token; it must not be handed out again.
    async fn mark_invalid(&self, alias: &str);

    /// Try to obtain a fresh token after [`Self::mark_invalid`].
    async fn refresh(&self, alias: &str) -> Option<Secret<String>>;
}

pub type SharedCredentialResolver = Arc<dyn CredentialResolver>;

/// Resolver for deployments without any remote auth.
pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn resolve_token(&self, _alias: &str) -> Option<Secret<String>> {
        None
    }

    async fn mark_invalid(&self, _alias: &str) {}

    async fn refresh(&self, _alias: &str) -> Option<Secret<String>> {
        None
    }
}

/// Fixed tokens keyed by alias, e.g. loaded from the environment.
///
/// A token marked invalid stays withheld until [`StaticCredentials::set`]
/// installs a new one; `refresh` cannot mint tokens on its own.
#[derive(Default)]
pub struct StaticCredentials {
    tokens: RwLock<HashMap<String, TokenSlot>>,
}

struct TokenSlot {
    token: Secret<String>,
    valid: bool,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, alias: impl Into<String>, token: impl Into<String>) {
        self.tokens.write().await.insert(alias.into(), TokenSlot {
            token: Secret::new(token.into()),
            valid: true,
        });
    }

    pub async fn remove(&self, alias: &str) {
        self.tokens.write().await.remove(alias);
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve_token(&self, alias: &str) -> Option<Secret<String>> {
        self.tokens
            .read()
            .await
            .get(alias)
            .filter(|slot| slot.valid)
            .map(|slot| Secret::new(slot.token.expose_secret().clone()))
    }

    async fn mark_invalid(&self, alias: &str) {
        if let Some(slot) = self.tokens.write().await.get_mut(alias) {
            debug!(alias = %alias, "credential marked invalid");
            slot.valid = false;
        }
    }

    async fn refresh(&self, alias: &str) -> Option<Secret<String>> {
        self.resolve_token(alias).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_credentials_never_resolves() {
        let resolver = NoCredentials;
        assert!(resolver.resolve_token("any").await.is_none());
        assert!(resolver.refresh("any").await.is_none());
    }

    #[tokio::test]
    async fn static_token_is_withheld_after_mark_invalid() {
        let resolver = StaticCredentials::new();
        resolver.set("linear", "tok-1").await;
        assert_eq!(
            resolver
                .resolve_token("linear")
                .await
                .unwrap()
                .expose_secret(),
            "tok-1"
        );

        resolver.mark_invalid("linear").await;
        assert!(resolver.resolve_token("linear").await.is_none());
        assert!(resolver.refresh("linear").await.is_none());

        resolver.set("linear", "tok-2").await;
        assert_eq!(
            resolver.refresh("linear").await.unwrap().expose_secret(),
            "tok-2"
        );
    }
}
