//! Snapshot cache: persists the latest snapshot per project and decides when
//! a rebuild is needed.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    futures::future::join_all,
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use {bundler_common::definitions::snapshot as snapshot_metrics, metrics::counter};

use crate::{
    aggregator::{IntegrityWarning, build_snapshot},
    error::{Error, Result},
    project::Project,
    provider::{CapabilityProvider, RawCapabilitySet},
    snapshot::Snapshot,
};

/// Bump when the serialized [`Snapshot`] layout changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCacheEntry {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    /// JSON-serialized [`Snapshot`].
    pub payload: String,
    pub revision: u64,
    /// Aliases left out of the payload because their fetch failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

/// Rebuild when missing, from another format version, empty, older than the
/// project's last mutation, or built while some upstream was unreachable.
pub fn is_stale(entry: Option<&SnapshotCacheEntry>, last_mutated: DateTime<Utc>) -> bool {
    match entry {
        None => true,
        Some(entry) => {
            entry.version != CACHE_FORMAT_VERSION
                || entry.payload.trim().is_empty()
                || entry.generated_at < last_mutated
                || !entry.missing.is_empty()
        },
    }
}

/// Backing storage for cache entries, keyed by project slug.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, project: &str) -> Result<Option<SnapshotCacheEntry>>;
    async fn save(&self, project: &str, entry: &SnapshotCacheEntry) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<HashMap<String, SnapshotCacheEntry>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, project: &str) -> Result<Option<SnapshotCacheEntry>> {
        Ok(self.entries.read().await.get(project).cloned())
    }

    async fn save(&self, project: &str, entry: &SnapshotCacheEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(project.to_string(), entry.clone());
        Ok(())
    }
}

/// One `<slug>.snapshot.json` file per project.
pub struct JsonFileSnapshotStore {
    dir: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{project}.snapshot.json"))
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn load(&self, project: &str) -> Result<Option<SnapshotCacheEntry>> {
        let path = self.path_for(project);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable snapshot cache file");
                Ok(None)
            },
        }
    }

    async fn save(&self, project: &str, entry: &SnapshotCacheEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(project);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "snapshot cache written");
        Ok(())
    }
}

struct Decoded {
    version: u32,
    generated_at: DateTime<Utc>,
    snapshot: Arc<Snapshot>,
}

/// Result of [`SnapshotCache::ensure_snapshot`] / [`SnapshotCache::rebuild`].
#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    pub snapshot: Arc<Snapshot>,
    pub rebuilt: bool,
    pub revision: u64,
    pub warnings: Vec<IntegrityWarning>,
    /// Upstreams whose capabilities could not be fetched, with the error text.
    pub failed_upstreams: Vec<(String, String)>,
}

pub struct SnapshotCache {
    store: Arc<dyn SnapshotStore>,
    /// Keyed by project slug; reused while `(version, generated_at)` matches the store.
    decoded: RwLock<HashMap<String, Decoded>>,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            decoded: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySnapshotStore::new()))
    }

    async fn decode(&self, project: &str, entry: &SnapshotCacheEntry) -> Result<Arc<Snapshot>> {
        if let Some(hit) = self.decoded.read().await.get(project)
            && hit.version == entry.version
            && hit.generated_at == entry.generated_at
        {
            return Ok(Arc::clone(&hit.snapshot));
        }

        let snapshot: Arc<Snapshot> = Arc::new(serde_json::from_str(&entry.payload)?);
        self.decoded.write().await.insert(project.to_string(), Decoded {
            version: entry.version,
            generated_at: entry.generated_at,
            snapshot: Arc::clone(&snapshot),
        });
        debug!(project = %project, "decoded cached snapshot");
        Ok(snapshot)
    }

    /// The last built or decoded snapshot for `project`.
    pub async fn snapshot(&self, project: &Project) -> Result<Arc<Snapshot>> {
        let unavailable = || Error::SnapshotUnavailable {
            project: project.slug.clone(),
        };
        let entry = self.store.load(&project.slug).await?.ok_or_else(unavailable)?;
        if entry.payload.trim().is_empty() {
            return Err(unavailable());
        }
        self.decode(&project.slug, &entry).await
    }

    /// Serve the cached snapshot unless it is stale, otherwise rebuild.
    pub async fn ensure_snapshot(
        &self,
        project: &mut Project,
        provider: &dyn CapabilityProvider,
    ) -> Result<EnsureOutcome> {
        let entry = self.store.load(&project.slug).await?;
        if !is_stale(entry.as_ref(), project.last_mutated)
            && let Some(entry) = entry
        {
            match self.decode(&project.slug, &entry).await {
                Ok(snapshot) => {
                    project.revision = project.revision.max(entry.revision);
                    return Ok(EnsureOutcome {
                        snapshot,
                        rebuilt: false,
                        revision: project.revision,
                        warnings: Vec::new(),
                        failed_upstreams: Vec::new(),
                    });
                },
                Err(e) => {
                    warn!(project = %project.slug, error = %e, "cached snapshot undecodable, rebuilding");
                },
            }
        }
        self.rebuild(project, provider).await
    }

    /// Fetch every upstream, aggregate, persist, and bump the revision.
    ///
    /// Upstreams that fail to answer are left out of this snapshot rather
    /// than failing the rebuild.
    pub async fn rebuild(
        &self,
        project: &mut Project,
        provider: &dyn CapabilityProvider,
    ) -> Result<EnsureOutcome> {
        let fetched = join_all(
            project
                .upstreams
                .iter()
                .map(|upstream| provider.fetch_capabilities(upstream)),
        )
        .await;

        let mut inputs: Vec<(_, RawCapabilitySet)> = Vec::with_capacity(fetched.len());
        let mut failed_upstreams = Vec::new();
        for (upstream, result) in project.upstreams.iter().zip(fetched) {
            match result {
                Ok(raw) => inputs.push((upstream.clone(), raw)),
                Err(e) => {
                    warn!(alias = %upstream.alias, error = %e, "failed to fetch upstream capabilities");
                    failed_upstreams.push((upstream.alias.clone(), e.to_string()));
                },
            }
        }

        let aggregation = build_snapshot(&inputs);
        let snapshot = Arc::new(aggregation.snapshot);
        let previous = self.store.load(&project.slug).await.ok().flatten();
        let revision = project
            .revision
            .max(previous.map_or(0, |e| e.revision))
            + 1;

        let entry = SnapshotCacheEntry {
            version: CACHE_FORMAT_VERSION,
            generated_at: Utc::now(),
            payload: serde_json::to_string(snapshot.as_ref())?,
            revision,
            missing: failed_upstreams
                .iter()
                .map(|(alias, _)| alias.clone())
                .collect(),
        };
        self.store.save(&project.slug, &entry).await?;
        self.decoded
            .write()
            .await
            .insert(project.slug.clone(), Decoded {
                version: entry.version,
                generated_at: entry.generated_at,
                snapshot: Arc::clone(&snapshot),
            });
        project.revision = revision;

        #[cfg(feature = "metrics")]
        counter!(snapshot_metrics::REBUILDS_TOTAL).increment(1);
        info!(
            project = %project.slug,
            revision,
            tools = snapshot.tools.len(),
            prompts = snapshot.prompts.len(),
            resources = snapshot.resources.len(),
            warnings = aggregation.warnings.len(),
            missing = failed_upstreams.len(),
            "snapshot rebuilt"
        );

        Ok(EnsureOutcome {
            snapshot,
            rebuilt: true,
            revision,
            warnings: aggregation.warnings,
            failed_upstreams,
        })
    }
}
