//! Capability catalog: aggregation of upstream tools, prompts and resources
//! into namespaced snapshots, and the cache that keeps them between runs.

pub mod aggregator;
pub mod cache;
pub mod error;
pub mod namespace;
pub mod project;
pub mod provider;
pub mod snapshot;

pub use {
    aggregator::{Aggregation, CapabilityKind, IntegrityWarning, build_snapshot},
    cache::{
        CACHE_FORMAT_VERSION, EnsureOutcome, JsonFileSnapshotStore, MemorySnapshotStore,
        SnapshotCache, SnapshotCacheEntry, SnapshotStore, is_stale,
    },
    error::{Error, Result},
    project::{Project, descriptor_from_entry, slugify},
    provider::{CapabilityProvider, RawCapabilitySet},
    snapshot::{NamespacedPrompt, NamespacedResource, NamespacedTool, Snapshot, Target},
};
