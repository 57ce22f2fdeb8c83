//! The Router / Server Manager: serves list and call operations against the
//! active snapshot and forwards resolved calls to upstream connections.

use std::{
    future::Future,
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use {
    bundler_catalog::{
        EnsureOutcome, Project, Snapshot, SnapshotCache, namespace::wrap_resource_uri,
    },
    bundler_config::{RouterConfig, VisibilityRule, schema::DEFAULT_LARGE_RESPONSE_THRESHOLD},
    bundler_mcp::{
        McpClientTrait, McpTransportError, UpstreamDescriptor, UpstreamManager, UpstreamStatus,
        lifecycle::DEFAULT_BACKOFF,
        types::{
            McpPromptDef, McpResourceDef, McpToolDef, PromptsGetResult, ResourceContents,
            ResourcesReadResult, ToolsCallResult,
        },
    },
    serde::Serialize,
    serde_json::{Value, json},
    tokio::sync::{Mutex, RwLock, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use {
    bundler_common::definitions::router as router_metrics,
    metrics::{counter, histogram},
};

use crate::{
    error::{Result, RouterError},
    meta::{
        self, CALL_TOOL, CallArgs, FETCH_TOOL, FetchArgs, SEARCH_TOOL, SearchArgs, SearchHit,
        parse_args,
    },
    provider::LiveCapabilityProvider,
    restart::{RestartTracker, is_stale_session},
    spill::Spillover,
    visibility::VisibilityPolicy,
};

const FILE_URI_PREFIX: &str = "file://";

fn record_tool_error(alias: &str) {
    #[cfg(feature = "metrics")]
    counter!(router_metrics::TOOL_CALL_ERRORS_TOTAL, "alias" => alias.to_string()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = alias;
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub large_response_threshold: usize,
    pub meta_tools: bool,
    pub visibility: Vec<VisibilityRule>,
    /// Where spilled responses are written.
    pub spill_dir: PathBuf,
    /// Delays between probes of upstreams left out of the snapshot. The last
    /// delay repeats until every upstream is back.
    pub recovery_backoff: Vec<Duration>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            large_response_threshold: DEFAULT_LARGE_RESPONSE_THRESHOLD,
            meta_tools: false,
            visibility: Vec::new(),
            spill_dir: std::env::temp_dir(),
            recovery_backoff: DEFAULT_BACKOFF.to_vec(),
        }
    }
}

impl RouterSettings {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            large_response_threshold: config.large_response_threshold,
            meta_tools: config.meta_tools,
            visibility: config.visibility.clone(),
            ..Self::default()
        }
    }
}

/// Upstream status enriched with router-side state.
#[derive(Debug, Clone, Serialize)]
pub struct RouterUpstreamStatus {
    #[serde(flatten)]
    pub upstream: UpstreamStatus,
    pub restarting: bool,
    pub tools: usize,
}

pub struct Router {
    project_slug: String,
    /// Edits and rebuilds hold this for their whole duration.
    project: Mutex<Project>,
    snapshot: RwLock<Arc<Snapshot>>,
    revision: watch::Sender<u64>,
    cache: SnapshotCache,
    upstreams: Arc<UpstreamManager>,
    provider: LiveCapabilityProvider,
    restarts: RestartTracker,
    spill: Spillover,
    visibility: VisibilityPolicy,
    meta_tools: bool,
    /// Aliases left out of the active snapshot.
    missing: watch::Sender<Vec<String>>,
    recovery_backoff: Vec<Duration>,
    recovery_started: AtomicBool,
    cancel: CancellationToken,
}

impl Router {
    pub fn new(
        project: Project,
        upstreams: Arc<UpstreamManager>,
        cache: SnapshotCache,
        settings: RouterSettings,
    ) -> Self {
        let (revision, _) = watch::channel(project.revision);
        let (missing, _) = watch::channel(Vec::new());
        Self {
            project_slug: project.slug.clone(),
            project: Mutex::new(project),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            revision,
            cache,
            provider: LiveCapabilityProvider::new(Arc::clone(&upstreams)),
            upstreams,
            restarts: RestartTracker::new(),
            spill: Spillover::new(settings.spill_dir, settings.large_response_threshold),
            visibility: VisibilityPolicy::from_rules(&settings.visibility),
            meta_tools: settings.meta_tools,
            missing,
            recovery_backoff: settings.recovery_backoff,
            recovery_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn project_slug(&self) -> &str {
        &self.project_slug
    }

    pub fn meta_tools_enabled(&self) -> bool {
        self.meta_tools
    }

    pub fn upstreams(&self) -> &Arc<UpstreamManager> {
        &self.upstreams
    }

    pub fn spillover(&self) -> &Spillover {
        &self.spill
    }

    /// The active snapshot. Empty until [`Router::start`] has run.
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Changes whenever a rebuild produced a new revision.
    pub fn subscribe_revisions(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Register the project's upstreams, schedule warm-ups and load or build
    /// the snapshot.
    ///
    /// Also starts the background task that rebuilds the snapshot once an
    /// upstream left out of it becomes reachable.
    pub async fn start(self: &Arc<Self>) -> Result<EnsureOutcome> {
        if !self.recovery_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(run_recovery(
                Arc::downgrade(self),
                self.missing.subscribe(),
                self.recovery_backoff.clone(),
                self.cancel.clone(),
            ));
        }
        let mut project = self.project.lock().await;
        self.reconcile(&mut project).await
    }

    /// Aliases whose capabilities are missing from the active snapshot.
    pub fn missing_upstreams(&self) -> Vec<String> {
        self.missing.borrow().clone()
    }

    async fn publish(&self, outcome: &EnsureOutcome) {
        *self.snapshot.write().await = Arc::clone(&outcome.snapshot);

        // Before the revision, so revision watchers see the matching set.
        let missing: Vec<String> = outcome
            .failed_upstreams
            .iter()
            .map(|(alias, _)| alias.clone())
            .collect();
        self.missing.send_if_modified(|current| {
            if *current == missing {
                false
            } else {
                *current = missing;
                true
            }
        });

        let changed = self.revision.send_if_modified(|current| {
            if *current == outcome.revision {
                false
            } else {
                *current = outcome.revision;
                true
            }
        });
        if changed {
            debug!(revision = outcome.revision, "snapshot revision published");
        }
    }

    /// Probe the left-out aliases and rebuild if any of them answers.
    async fn recover(&self, missing: &[String]) -> Result<bool> {
        let mut reachable = Vec::new();
        for alias in missing {
            let Ok(lifecycle) = self.upstreams.lifecycle(alias).await else {
                continue;
            };
            match lifecycle.connection().await {
                Ok(_) => reachable.push(alias.as_str()),
                Err(e) => debug!(alias = %alias, error = %e, "left-out upstream still unreachable"),
            }
        }
        if reachable.is_empty() {
            return Ok(false);
        }

        info!(aliases = ?reachable, "left-out upstreams reachable again, rebuilding snapshot");
        let mut project = self.project.lock().await;
        let outcome = self.cache.ensure_snapshot(&mut project, &self.provider).await?;
        self.publish(&outcome).await;
        Ok(outcome.rebuilt)
    }

    async fn reconcile(&self, project: &mut Project) -> Result<EnsureOutcome> {
        let report = self
            .upstreams
            .sync(project.upstreams.clone())
            .await
            .map_err(RouterError::from_lifecycle)?;
        for alias in &report.reconfigured {
            self.restarts.mark(alias).await;
        }
        for alias in &report.removed {
            self.restarts.clear(alias).await;
        }
        if !report.is_empty() {
            info!(
                added = ?report.added,
                reconfigured = ?report.reconfigured,
                removed = ?report.removed,
                "upstreams reconciled"
            );
        }

        let outcome = self.cache.ensure_snapshot(project, &self.provider).await?;
        self.publish(&outcome).await;
        Ok(outcome)
    }

    // ── Project edits ───────────────────────────────────────────────────

    pub async fn add_upstream(&self, descriptor: UpstreamDescriptor) -> Result<EnsureOutcome> {
        let mut project = self.project.lock().await;
        project.add_upstream(descriptor)?;
        self.reconcile(&mut project).await
    }

    pub async fn update_upstream(&self, descriptor: UpstreamDescriptor) -> Result<EnsureOutcome> {
        let mut project = self.project.lock().await;
        project.update_upstream(descriptor)?;
        self.reconcile(&mut project).await
    }

    pub async fn remove_upstream(&self, alias: &str) -> Result<EnsureOutcome> {
        let mut project = self.project.lock().await;
        project.remove_upstream(alias)?;
        self.reconcile(&mut project).await
    }

    /// Re-fetch every upstream and rebuild regardless of staleness.
    pub async fn refresh(&self) -> Result<EnsureOutcome> {
        let mut project = self.project.lock().await;
        let outcome = self.cache.rebuild(&mut project, &self.provider).await?;
        self.publish(&outcome).await;
        Ok(outcome)
    }

    pub async fn statuses(&self) -> Vec<RouterUpstreamStatus> {
        let snapshot = self.snapshot().await;
        let restarting = self.restarts.aliases().await;
        self.upstreams
            .statuses()
            .await
            .into_iter()
            .map(|upstream| RouterUpstreamStatus {
                restarting: restarting.contains(&upstream.alias),
                tools: snapshot.tool_count_for(&upstream.alias),
                upstream,
            })
            .collect()
    }

    /// Cancel background work and close every upstream.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.upstreams.shutdown().await;
    }

    // ── Listing ─────────────────────────────────────────────────────────

    fn is_visible(&self, client: Option<&str>, alias: &str) -> bool {
        !self.visibility.is_hidden(client, alias)
    }

    pub async fn list_tools(&self, client: Option<&str>) -> Vec<McpToolDef> {
        let mut tools = if self.meta_tools {
            vec![meta::search_tool_def(), meta::call_tool_def()]
        } else {
            self.snapshot()
                .await
                .tools
                .iter()
                .filter(|t| self.is_visible(client, &t.alias))
                .map(|t| t.exposed())
                .collect()
        };
        tools.push(meta::fetch_tool_def());
        tools
    }

    pub async fn list_prompts(&self, client: Option<&str>) -> Vec<McpPromptDef> {
        self.snapshot()
            .await
            .prompts
            .iter()
            .filter(|p| self.is_visible(client, &p.alias))
            .map(|p| p.exposed())
            .collect()
    }

    /// Upstream resources followed by spilled temp files.
    pub async fn list_resources(&self, client: Option<&str>) -> Vec<McpResourceDef> {
        let mut resources: Vec<McpResourceDef> = self
            .snapshot()
            .await
            .resources
            .iter()
            .filter(|r| self.is_visible(client, &r.alias))
            .map(|r| r.exposed())
            .collect();
        resources.extend(
            self.spill
                .entries()
                .await
                .into_iter()
                .map(|entry| McpResourceDef {
                    uri: entry.uri(),
                    description: Some(format!(
                        "Large tool response saved at {}",
                        entry.created_at.to_rfc3339()
                    )),
                    mime_type: Some(entry.mime_type),
                    name: entry.name,
                }),
        );
        resources
    }

    // ── Calls ───────────────────────────────────────────────────────────

    pub async fn call_tool(
        &self,
        client: Option<&str>,
        name: &str,
        arguments: Value,
    ) -> Result<ToolsCallResult> {
        match name {
            FETCH_TOOL => self.fetch_large_response(arguments).await,
            SEARCH_TOOL if self.meta_tools => self.search_capabilities(client, arguments).await,
            CALL_TOOL if self.meta_tools => {
                let args: CallArgs = parse_args(CALL_TOOL, arguments)?;
                if meta::is_bundler_tool(&args.name) {
                    return Err(RouterError::InvalidParams(format!(
                        "{CALL_TOOL} cannot invoke '{}'",
                        args.name
                    )));
                }
                self.call_upstream_tool(client, &args.name, args.arguments)
                    .await
            },
            _ => self.call_upstream_tool(client, name, arguments).await,
        }
    }

    async fn call_upstream_tool(
        &self,
        client: Option<&str>,
        name: &str,
        arguments: Value,
    ) -> Result<ToolsCallResult> {
        let snapshot = self.snapshot().await;
        let target = snapshot
            .resolve_tool(name)
            .cloned()
            .ok_or_else(|| RouterError::unknown("tool", name))?;
        if !self.is_visible(client, &target.alias) {
            info!(tool = %name, client = ?client, "rejected call to hidden tool");
            return Err(RouterError::unknown("tool", name));
        }

        #[cfg(feature = "metrics")]
        counter!(router_metrics::TOOL_CALLS_TOTAL, "alias" => target.alias.clone()).increment(1);
        let started = Instant::now();

        let original = target.original.as_str();
        let outcome = self
            .dispatch(&target.alias, |upstream| {
                let arguments = arguments.clone();
                async move { upstream.call_tool(original, arguments).await }
            })
            .await;

        let elapsed = started.elapsed();
        #[cfg(feature = "metrics")]
        histogram!(router_metrics::TOOL_CALL_DURATION_SECONDS, "alias" => target.alias.clone())
            .record(elapsed.as_secs_f64());

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                record_tool_error(&target.alias);
                return Err(e);
            },
        };
        debug!(
            tool = %name,
            alias = %target.alias,
            elapsed_ms = elapsed.as_millis() as u64,
            is_error = result.is_error,
            "tool call forwarded"
        );
        if result.is_error {
            record_tool_error(&target.alias);
        }

        if !self.spill.exceeds_threshold(&result) {
            return Ok(result);
        }
        match self.spill.spill(&self.project_slug, name, &result).await {
            Ok(pointer) => Ok(pointer),
            Err(e) => {
                warn!(tool = %name, error = %e, "failed to spill large response, returning inline");
                Ok(result)
            },
        }
    }

    pub async fn get_prompt(
        &self,
        client: Option<&str>,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<PromptsGetResult> {
        let snapshot = self.snapshot().await;
        let target = snapshot
            .resolve_prompt(name)
            .cloned()
            .ok_or_else(|| RouterError::unknown("prompt", name))?;
        if !self.is_visible(client, &target.alias) {
            info!(prompt = %name, client = ?client, "rejected hidden prompt");
            return Err(RouterError::unknown("prompt", name));
        }

        #[cfg(feature = "metrics")]
        counter!(router_metrics::PROMPT_FETCHES_TOTAL, "alias" => target.alias.clone()).increment(1);

        let original = target.original.as_str();
        self.dispatch(&target.alias, |upstream| {
            let arguments = arguments.clone();
            async move { upstream.get_prompt(original, arguments).await }
        })
        .await
    }

    pub async fn read_resource(&self, client: Option<&str>, uri: &str) -> Result<ResourcesReadResult> {
        #[cfg(feature = "metrics")]
        counter!(router_metrics::RESOURCE_READS_TOTAL).increment(1);

        if let Some(path) = uri.strip_prefix(FILE_URI_PREFIX) {
            let (text, mime_type) = self.spill.read_resource(path).await?;
            return Ok(ResourcesReadResult {
                contents: vec![ResourceContents {
                    uri: uri.to_string(),
                    mime_type: Some(mime_type),
                    text: Some(text),
                    blob: None,
                }],
            });
        }

        let snapshot = self.snapshot().await;
        let target = snapshot
            .resolve_resource(uri)
            .cloned()
            .ok_or_else(|| RouterError::unknown("resource", uri))?;
        if !self.is_visible(client, &target.alias) {
            info!(uri = %uri, client = ?client, "rejected hidden resource");
            return Err(RouterError::unknown("resource", uri));
        }

        let original = target.original.as_str();
        let mut result = self
            .dispatch(&target.alias, |upstream| async move {
                upstream.read_resource(original).await
            })
            .await?;
        for content in &mut result.contents {
            content.uri = if content.uri == target.original {
                uri.to_string()
            } else {
                wrap_resource_uri(&target.alias, &content.uri)
            };
        }
        Ok(result)
    }

    async fn search_capabilities(
        &self,
        client: Option<&str>,
        arguments: Value,
    ) -> Result<ToolsCallResult> {
        let args: SearchArgs = parse_args(SEARCH_TOOL, arguments)?;
        let snapshot = self.snapshot().await;
        let matches = meta::search(&snapshot, &args.query, |t| self.is_visible(client, &t.alias));
        let total = matches.len();
        let hits: Vec<SearchHit> = matches
            .into_iter()
            .take(args.limit.unwrap_or(usize::MAX))
            .map(SearchHit::from)
            .collect();
        debug!(query = %args.query, total, "capability search");

        let body = json!({ "query": args.query, "total": total, "tools": hits });
        Ok(ToolsCallResult {
            structured_content: Some(body.clone()),
            ..ToolsCallResult::text(serde_json::to_string_pretty(&body)?)
        })
    }

    async fn fetch_large_response(&self, arguments: Value) -> Result<ToolsCallResult> {
        let args: FetchArgs = parse_args(FETCH_TOOL, arguments)?;
        let chunk = self.spill.fetch(&args.path, args.offset, args.length).await?;
        let meta = json!({
            "path": chunk.path,
            "offset": chunk.offset,
            "length": chunk.length,
            "totalBytes": chunk.total_bytes,
            "eof": chunk.eof,
        });
        Ok(ToolsCallResult {
            structured_content: Some(meta),
            ..ToolsCallResult::text(chunk.text)
        })
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Run `op` against a ready connection for `alias`.
    ///
    /// A stale-session failure resets the connection and retries once.
    /// Connection failures tear the connection down (keep-warm upstreams
    /// reconnect in the background) and mark the alias as restarting until
    /// a later call succeeds.
    async fn dispatch<T, F, Fut>(&self, alias: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn McpClientTrait>) -> Fut,
        Fut: Future<Output = bundler_mcp::Result<T>>,
    {
        let lifecycle = self
            .upstreams
            .lifecycle(alias)
            .await
            .map_err(RouterError::from_lifecycle)?;
        let mut retried = false;

        loop {
            let upstream = match lifecycle.connection().await {
                Ok(upstream) => upstream,
                Err(e) => {
                    if self.restarts.is_restarting(alias).await {
                        debug!(alias = %alias, error = %e, "upstream still restarting");
                        return Err(RouterError::Restarting {
                            alias: alias.to_string(),
                        });
                    }
                    return Err(RouterError::from_lifecycle(e));
                },
            };

            let err = match op(upstream).await {
                Ok(value) => {
                    if self.restarts.clear(alias).await {
                        info!(alias = %alias, "upstream recovered");
                    }
                    return Ok(value);
                },
                Err(err) => err,
            };

            let message = err.to_string();
            let stale = is_stale_session(&message);
            if stale && !retried {
                retried = true;
                #[cfg(feature = "metrics")]
                counter!(router_metrics::STALE_SESSION_RETRIES_TOTAL, "alias" => alias.to_string())
                    .increment(1);
                warn!(alias = %alias, error = %message, "stale upstream session, reconnecting and retrying once");
                lifecycle.disconnect().await;
                continue;
            }

            let connection_lost = stale || err.is_connection_failure();
            let timed_out = matches!(
                err,
                bundler_mcp::Error::Transport(McpTransportError::Timeout { .. })
            );
            if connection_lost || timed_out {
                warn!(alias = %alias, error = %message, "upstream dispatch failed, resetting connection");
                self.restarts.mark(alias).await;
                lifecycle.report_failure().await;
            }

            return Err(if connection_lost {
                RouterError::Connection {
                    alias: alias.to_string(),
                    reason: message,
                }
            } else {
                RouterError::Upstream {
                    alias: alias.to_string(),
                    message,
                }
            });
        }
    }
}

/// Background loop behind [`Router::start`]: while the snapshot lacks some
/// upstreams, probe them on `backoff` and rebuild once one is reachable.
async fn run_recovery(
    router: Weak<Router>,
    mut missing: watch::Receiver<Vec<String>>,
    backoff: Vec<Duration>,
    cancel: CancellationToken,
) {
    let mut attempt = 0;
    loop {
        let current = missing.borrow_and_update().clone();
        if current.is_empty() {
            attempt = 0;
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = missing.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                },
            }
        }

        let delay = backoff
            .get(attempt)
            .or_else(|| backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(30));
        tokio::select! {
            () = cancel.cancelled() => return,
            changed = missing.changed() => {
                if changed.is_err() {
                    return;
                }
                attempt = 0;
                continue;
            },
            () = tokio::time::sleep(delay) => {},
        }

        let Some(router) = router.upgrade() else {
            return;
        };
        attempt += 1;
        match router.recover(&current).await {
            Ok(true) => debug!("snapshot rebuilt after upstream recovery"),
            Ok(false) => {},
            Err(e) => warn!(error = %e, "snapshot rebuild after upstream recovery failed"),
        }
    }
}
