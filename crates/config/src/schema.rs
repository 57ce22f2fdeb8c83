//! Config schema types (project, upstreams, router, lifecycle, cache).

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Default inline-size ceiling for tool responses, in bytes.
pub const DEFAULT_LARGE_RESPONSE_THRESHOLD: usize = 100_000;
/// Default ceiling for waiting on an upstream to become ready.
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 10;
/// Default per-request timeout towards an upstream.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlerConfig {
    pub server: ServerConfig,
    pub project: ProjectConfig,
    pub router: RouterConfig,
    pub lifecycle: LifecycleConfig,
    pub cache: CacheConfig,
}

/// Identity the bundler reports to clients in `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    /// Optional instructions text returned from `initialize`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mcp-bundler".into(),
            instructions: None,
        }
    }
}

/// The logical project whose upstreams are bundled behind one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Short name, used in spill file names and as the snapshot cache key.
    pub name: String,
    /// Upstreams in registration order. Aggregation scans them in this order,
    /// so on a namespace collision the later entry wins.
    #[serde(rename = "upstream", alias = "upstreams")]
    pub upstreams: Vec<UpstreamEntry>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            upstreams: Vec::new(),
        }
    }
}

/// How the bundler reaches an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawn a local child process and speak JSON-RPC over stdin/stdout.
    #[default]
    Stdio,
    /// Streamable HTTP against a remote base URL.
    #[serde(alias = "sse", alias = "remote")]
    Http,
}

/// Configuration for a single upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamEntry {
    /// Unique short name. Becomes the namespace prefix (`alias__tool`).
    pub alias: String,
    pub transport: TransportKind,
    /// Executable for stdio upstreams.
    pub command: String,
    pub args: Vec<String>,
    /// Working directory for the child process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Base URL for http upstreams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Allow-list of original tool names. Empty means every tool is exposed.
    pub include_tools: Vec<String>,
    /// Connect proactively in the background and reconnect after failures.
    pub keep_warm: bool,
    /// Whether the upstream needs a bearer credential from the resolver.
    pub auth: bool,
    /// Skip the entry entirely when false.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UpstreamEntry {
    fn default() -> Self {
        Self {
            alias: String::new(),
            transport: TransportKind::default(),
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            url: None,
            headers: BTreeMap::new(),
            include_tools: Vec::new(),
            keep_warm: false,
            auth: false,
            enabled: true,
        }
    }
}

/// Router behaviour towards downstream clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Tool results whose text exceeds this many bytes are spilled to a temp file.
    pub large_response_threshold: usize,
    /// Replace the full tool listing with search/call meta-tools.
    pub meta_tools: bool,
    /// Aliases hidden from specific client types.
    pub visibility: Vec<VisibilityRule>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            large_response_threshold: DEFAULT_LARGE_RESPONSE_THRESHOLD,
            meta_tools: false,
            visibility: Vec::new(),
        }
    }
}

/// Hide a set of aliases from one client type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityRule {
    /// Client name as reported in `initialize` (matched after normalisation).
    pub client: String,
    pub hide_aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub ready_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: DEFAULT_READY_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for persisted snapshots. In-memory only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}
