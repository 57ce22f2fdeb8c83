//! Request routing for the bundler.
//!
//! This crate provides:
//! - the [`Router`]: resolution against the active snapshot, dispatch to
//!   upstream connections, stale-session retry and restart tracking
//! - large-response spillover with a bounded temp-resource ring (`spill`)
//! - the capability search / call-by-name meta-tools (`meta`)
//! - per-client alias hiding (`visibility`)
//! - server-side JSON-RPC dispatch (`server`) over a duplex message channel
//!   (`channel`), driven by the serve loop (`serve`)

pub mod channel;
pub mod error;
pub mod meta;
pub mod provider;
pub mod restart;
pub mod router;
pub mod serve;
pub mod server;
pub mod spill;
pub mod visibility;

pub use {
    channel::{LineChannel, MessageChannel, StdioChannel},
    error::{Result, RouterError},
    provider::LiveCapabilityProvider,
    router::{Router, RouterSettings, RouterUpstreamStatus},
    serve::serve,
    server::McpServer,
    spill::{Spillover, TempResourceEntry},
    visibility::normalize_client_name,
};
