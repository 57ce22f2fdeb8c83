//! Shared error definitions and metric names used across all mcp-bundler crates.

pub mod definitions;
pub mod error;

pub use error::{Error, FromMessage, Result};
