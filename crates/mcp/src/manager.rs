//! UpstreamManager: the alias -> lifecycle registry for one project.

use std::{collections::HashMap, sync::Arc};

use {
    futures::future::join_all,
    serde::Serialize,
    tokio::sync::RwLock,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use crate::{
    error::LifecycleError,
    lifecycle::{ConnectionState, Connector, LifecycleSettings, UpstreamLifecycle},
    traits::McpClientTrait,
    upstream::UpstreamDescriptor,
};

/// Point-in-time view of one upstream.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub alias: String,
    pub kind: &'static str,
    pub state: ConnectionState,
    pub keep_warm: bool,
    pub reconnecting: bool,
    pub credentials_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// What [`UpstreamManager::sync`] changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    /// Aliases whose identity signature changed.
    pub reconfigured: Vec<String>,
    pub removed: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.reconfigured.is_empty() && self.removed.is_empty()
    }
}

/// Mutable state behind the single `RwLock` on [`UpstreamManager`].
#[derive(Default)]
struct UpstreamManagerInner {
    /// Registration order; this is the aggregation scan order.
    descriptors: Vec<UpstreamDescriptor>,
    lifecycles: HashMap<String, Arc<UpstreamLifecycle>>,
}

impl UpstreamManagerInner {
    fn position(&self, alias: &str) -> Option<usize> {
        self.descriptors.iter().position(|d| d.alias == alias)
    }
}

/// Owns one [`UpstreamLifecycle`] per registered alias.
pub struct UpstreamManager {
    inner: RwLock<UpstreamManagerInner>,
    connector: Arc<dyn Connector>,
    settings: LifecycleSettings,
    /// Parent of every lifecycle's token; cancelled on shutdown.
    cancel: CancellationToken,
}

impl UpstreamManager {
    pub fn new(connector: Arc<dyn Connector>, settings: LifecycleSettings) -> Self {
        Self {
            inner: RwLock::new(UpstreamManagerInner::default()),
            connector,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn new_lifecycle(&self, descriptor: UpstreamDescriptor) -> Arc<UpstreamLifecycle> {
        UpstreamLifecycle::new(
            descriptor,
            Arc::clone(&self.connector),
            self.settings.clone(),
            self.cancel.child_token(),
        )
    }

    fn ensure_running(&self) -> Result<(), LifecycleError> {
        if self.is_stopped() {
            return Err(LifecycleError::Stopped);
        }
        Ok(())
    }

    /// Descriptors in registration order.
    pub async fn descriptors(&self) -> Vec<UpstreamDescriptor> {
        self.inner.read().await.descriptors.clone()
    }

    pub async fn aliases(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .descriptors
            .iter()
            .map(|d| d.alias.clone())
            .collect()
    }

    /// Register a new upstream and warm it up if flagged.
    pub async fn add(&self, descriptor: UpstreamDescriptor) -> Result<(), LifecycleError> {
        self.ensure_running()?;
        let lifecycle = {
            let mut inner = self.inner.write().await;
            if inner.position(&descriptor.alias).is_some() {
                return Err(LifecycleError::Configuration {
                    alias: descriptor.alias.clone(),
                    reason: "alias already registered".into(),
                });
            }
            let lifecycle = self.new_lifecycle(descriptor.clone());
            inner
                .lifecycles
                .insert(descriptor.alias.clone(), Arc::clone(&lifecycle));
            inner.descriptors.push(descriptor);
            lifecycle
        };
        info!(alias = %lifecycle.alias(), "upstream registered");
        lifecycle.warm_up().await;
        Ok(())
    }

    /// Replace an upstream's descriptor. Returns `true` if it must reconnect.
    pub async fn update(&self, descriptor: UpstreamDescriptor) -> Result<bool, LifecycleError> {
        self.ensure_running()?;
        let lifecycle = {
            let mut inner = self.inner.write().await;
            let idx = inner
                .position(&descriptor.alias)
                .ok_or_else(|| LifecycleError::UnknownAlias {
                    alias: descriptor.alias.clone(),
                })?;
            inner.descriptors[idx] = descriptor.clone();
            inner.lifecycles.get(&descriptor.alias).cloned()
        };

        let Some(lifecycle) = lifecycle else {
            // Evicted; the next lookup recreates it from the new descriptor.
            return Ok(true);
        };
        let changed = lifecycle.update(descriptor).await;
        if changed {
            lifecycle.warm_up().await;
        }
        Ok(changed)
    }

    /// Unregister an upstream, cancelling its background work and closing it.
    pub async fn remove(&self, alias: &str) -> Result<(), LifecycleError> {
        let lifecycle = {
            let mut inner = self.inner.write().await;
            let idx = inner
                .position(alias)
                .ok_or_else(|| LifecycleError::UnknownAlias {
                    alias: alias.to_string(),
                })?;
            inner.descriptors.remove(idx);
            inner.lifecycles.remove(alias)
        };
        if let Some(lifecycle) = lifecycle {
            lifecycle.cancel_token().cancel();
            lifecycle.disconnect().await;
        }
        info!(alias = %alias, "upstream removed");
        Ok(())
    }

    /// Reconcile the registry with a full descriptor list, preserving its order.
    pub async fn sync(&self, descriptors: Vec<UpstreamDescriptor>) -> Result<SyncReport, LifecycleError> {
        self.ensure_running()?;
        let mut report = SyncReport::default();

        let (removed, kept, added) = {
            let mut inner = self.inner.write().await;
            let mut removed = Vec::new();
            inner.lifecycles.retain(|alias, lifecycle| {
                let keep = descriptors.iter().any(|d| &d.alias == alias);
                if !keep {
                    removed.push(Arc::clone(lifecycle));
                }
                keep
            });

            let mut kept = Vec::new();
            let mut added = Vec::new();
            for descriptor in &descriptors {
                match inner.lifecycles.get(&descriptor.alias) {
                    Some(lifecycle) => kept.push((Arc::clone(lifecycle), descriptor.clone())),
                    None if inner.position(&descriptor.alias).is_some() => {
                        // Known but evicted: recreated lazily.
                    },
                    None => {
                        let lifecycle = self.new_lifecycle(descriptor.clone());
                        inner
                            .lifecycles
                            .insert(descriptor.alias.clone(), Arc::clone(&lifecycle));
                        added.push(lifecycle);
                    },
                }
            }
            inner.descriptors = descriptors;
            (removed, kept, added)
        };

        for lifecycle in removed {
            lifecycle.cancel_token().cancel();
            lifecycle.disconnect().await;
            report.removed.push(lifecycle.alias().to_string());
        }
        for (lifecycle, descriptor) in kept {
            if lifecycle.update(descriptor).await {
                lifecycle.warm_up().await;
                report.reconfigured.push(lifecycle.alias().to_string());
            }
        }
        for lifecycle in added {
            lifecycle.warm_up().await;
            report.added.push(lifecycle.alias().to_string());
        }

        debug!(?report, "upstream registry synced");
        Ok(report)
    }

    /// The lifecycle for `alias`, recreating it if it was evicted.
    pub async fn lifecycle(&self, alias: &str) -> Result<Arc<UpstreamLifecycle>, LifecycleError> {
        self.ensure_running()?;
        if let Some(lifecycle) = self.inner.read().await.lifecycles.get(alias) {
            return Ok(Arc::clone(lifecycle));
        }

        let mut inner = self.inner.write().await;
        if let Some(lifecycle) = inner.lifecycles.get(alias) {
            return Ok(Arc::clone(lifecycle));
        }
        let idx = inner
            .position(alias)
            .ok_or_else(|| LifecycleError::UnknownAlias {
                alias: alias.to_string(),
            })?;
        let lifecycle = self.new_lifecycle(inner.descriptors[idx].clone());
        inner
            .lifecycles
            .insert(alias.to_string(), Arc::clone(&lifecycle));
        debug!(alias = %alias, "recreated evicted upstream lifecycle");
        Ok(lifecycle)
    }

    /// Drop the lifecycle for `alias` but keep its registration.
    pub async fn evict(&self, alias: &str) {
        let lifecycle = self.inner.write().await.lifecycles.remove(alias);
        if let Some(lifecycle) = lifecycle {
            lifecycle.cancel_token().cancel();
            lifecycle.disconnect().await;
            debug!(alias = %alias, "evicted upstream lifecycle");
        }
    }

    /// Shortcut for `lifecycle(alias)?.connection()`.
    pub async fn connection(&self, alias: &str) -> Result<Arc<dyn McpClientTrait>, LifecycleError> {
        self.lifecycle(alias).await?.connection().await
    }

    /// Status of every registered upstream, in registration order.
    pub async fn statuses(&self) -> Vec<UpstreamStatus> {
        let (descriptors, lifecycles) = {
            let inner = self.inner.read().await;
            (inner.descriptors.clone(), inner.lifecycles.clone())
        };

        let mut out = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let lifecycle = lifecycles.get(&descriptor.alias);
            let credentials_pending = match lifecycle {
                Some(lc) => lc.credentials_pending().await,
                None => false,
            };
            out.push(UpstreamStatus {
                kind: descriptor.connection.kind(),
                state: lifecycle.map_or(ConnectionState::Idle, |lc| lc.state()),
                keep_warm: descriptor.keep_warm,
                reconnecting: lifecycle.is_some_and(|lc| lc.is_reconnecting()),
                credentials_pending,
                last_error: lifecycle
                    .and_then(|lc| lc.last_failure())
                    .map(|e| e.to_string()),
                alias: descriptor.alias,
            });
        }
        out
    }

    /// Cancel background work, then disconnect every upstream in parallel.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let lifecycles: Vec<_> = self
            .inner
            .read()
            .await
            .lifecycles
            .values()
            .cloned()
            .collect();
        info!(count = lifecycles.len(), "shutting down upstreams");
        join_all(lifecycles.iter().map(|lc| lc.disconnect())).await;
    }
}
