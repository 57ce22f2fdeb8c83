//! Wiring from a loaded config to a started router.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    anyhow::{Context, Result, bail},
    bundler_catalog::{
        JsonFileSnapshotStore, MemorySnapshotStore, Project, SnapshotCache, SnapshotStore,
    },
    bundler_config::{BundlerConfig, Severity, validate},
    bundler_mcp::{
        LifecycleSettings, ProcessConnector, SharedCredentialResolver, StaticCredentials,
        UpstreamManager,
    },
    bundler_router::{Router, RouterSettings},
    chrono::{DateTime, Utc},
    tracing::{error, info, warn},
};

/// Load `path`, or discover the config in the standard locations.
pub fn load(path: Option<&Path>) -> Result<(BundlerConfig, Option<PathBuf>)> {
    match path {
        Some(path) => {
            let config = bundler_config::load_config(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            Ok((config, Some(path.to_path_buf())))
        },
        None => Ok(bundler_config::discover_and_load()),
    }
}

/// Log warnings and refuse to continue on validation errors.
pub fn ensure_valid(config: &BundlerConfig) -> Result<()> {
    let result = validate(config);
    for d in &result.diagnostics {
        match d.severity {
            Severity::Error => error!(path = %d.path, "{}", d.message),
            Severity::Warning => warn!(path = %d.path, "{}", d.message),
            Severity::Info => {},
        }
    }
    if result.has_errors() {
        bail!(
            "config has {} error(s); run `mcp-bundler check` for details",
            result.count(Severity::Error)
        );
    }
    Ok(())
}

/// When the config last changed. A persisted snapshot newer than this is
/// reused on startup.
pub fn last_mutated(path: Option<&Path>) -> DateTime<Utc> {
    path.and_then(|p| std::fs::metadata(p).ok())
        .and_then(|meta| meta.modified().ok())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(Utc::now)
}

/// Environment variable holding the bearer token for `alias`.
pub fn token_env_var(alias: &str) -> String {
    let suffix: String = alias
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MCP_BUNDLER_TOKEN_{suffix}")
}

async fn credentials(config: &BundlerConfig) -> SharedCredentialResolver {
    let credentials = StaticCredentials::new();
    for entry in config.project.upstreams.iter().filter(|e| e.enabled && e.auth) {
        let var = token_env_var(&entry.alias);
        match std::env::var(&var) {
            Ok(token) if !token.trim().is_empty() => credentials.set(&entry.alias, token).await,
            _ => warn!(
                alias = %entry.alias,
                env = %var,
                "no token in the environment, upstream stays pending"
            ),
        }
    }
    Arc::new(credentials)
}

fn snapshot_store(config: &BundlerConfig) -> Arc<dyn SnapshotStore> {
    match &config.cache.dir {
        Some(dir) => Arc::new(JsonFileSnapshotStore::new(dir)),
        None => Arc::new(MemorySnapshotStore::new()),
    }
}

/// Build the router for `config` and load or build its snapshot.
pub async fn start_router(config: &BundlerConfig, config_path: Option<&Path>) -> Result<Arc<Router>> {
    let credentials = credentials(config).await;
    let connector = Arc::new(ProcessConnector::new(
        Duration::from_secs(config.lifecycle.request_timeout_secs),
        Arc::clone(&credentials),
    ));
    let settings = LifecycleSettings {
        ready_timeout: Duration::from_secs(config.lifecycle.ready_timeout_secs),
        credentials,
        ..LifecycleSettings::default()
    };
    let upstreams = Arc::new(UpstreamManager::new(connector, settings));

    let project = Project::from_config(config, last_mutated(config_path));
    let router = Arc::new(Router::new(
        project,
        upstreams,
        SnapshotCache::new(snapshot_store(config)),
        RouterSettings::from_config(&config.router),
    ));

    let outcome = router.start().await.context("failed to build the capability snapshot")?;
    for (alias, reason) in &outcome.failed_upstreams {
        warn!(alias = %alias, reason = %reason, "upstream left out of the snapshot");
    }
    info!(
        project = %router.project_slug(),
        revision = outcome.revision,
        rebuilt = outcome.rebuilt,
        tools = outcome.snapshot.tools.len(),
        prompts = outcome.snapshot.prompts.len(),
        resources = outcome.snapshot.resources.len(),
        "snapshot ready"
    );
    Ok(router)
}
