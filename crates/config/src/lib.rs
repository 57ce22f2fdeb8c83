//! Configuration loading, validation and env substitution for mcp-bundler.
//!
//! Config files: `mcp-bundler.toml`, `mcp-bundler.yaml` or `mcp-bundler.json`,
//! searched in `./` then `~/.config/mcp-bundler/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        BundlerConfig, CacheConfig, LifecycleConfig, ProjectConfig, RouterConfig, ServerConfig,
        TransportKind, UpstreamEntry, VisibilityRule,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
