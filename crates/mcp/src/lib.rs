//! Upstream MCP connectivity for the bundler.
//!
//! This crate provides:
//! - JSON-RPC 2.0 wire types (`types`)
//! - stdio and streamable HTTP transports (`transport`, `http_transport`)
//! - the client handshake and capability queries (`client`)
//! - the credential resolver seam for remote upstreams (`credentials`)
//! - upstream descriptors and identity signatures (`upstream`)
//! - the per-upstream connection lifecycle (`lifecycle`) and its registry (`manager`)

pub mod client;
pub mod credentials;
pub mod error;
pub mod http_transport;
pub mod lifecycle;
pub mod manager;
pub mod traits;
pub mod transport;
pub mod types;
pub mod upstream;

pub use {
    client::{McpClient, McpClientState},
    credentials::{CredentialResolver, NoCredentials, SharedCredentialResolver, StaticCredentials},
    error::{Error, LifecycleError, McpTransportError, Result},
    lifecycle::{
        ConnectionState, Connector, LifecycleSettings, ProcessConnector, UpstreamLifecycle,
    },
    manager::{SyncReport, UpstreamManager, UpstreamStatus},
    traits::{McpClientTrait, McpTransport},
    upstream::{ConnectionParams, UpstreamDescriptor},
};
