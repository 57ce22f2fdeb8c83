//! Upstream descriptors and their identity signatures.

use std::{collections::BTreeMap, path::PathBuf};

use {
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

/// How to reach an upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionParams {
    /// A child process speaking JSON-RPC over stdio.
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// A streamable HTTP endpoint.
    Remote {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl ConnectionParams {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Remote { .. } => "remote",
        }
    }
}

/// One upstream server as registered in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDescriptor {
    pub alias: String,
    pub connection: ConnectionParams,
    /// Allow-list of original tool names; empty means every tool.
    #[serde(default)]
    pub include_tools: Vec<String>,
    #[serde(default)]
    pub keep_warm: bool,
    /// Bearer credentials come from the credential resolver.
    #[serde(default)]
    pub requires_auth: bool,
}

impl UpstreamDescriptor {
    pub fn local(alias: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            connection: ConnectionParams::Local {
                command: command.into(),
                args: Vec::new(),
                cwd: None,
                env: BTreeMap::new(),
            },
            include_tools: Vec::new(),
            keep_warm: false,
            requires_auth: false,
        }
    }

    pub fn remote(alias: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            connection: ConnectionParams::Remote {
                url: url.into(),
                headers: BTreeMap::new(),
            },
            include_tools: Vec::new(),
            keep_warm: false,
            requires_auth: false,
        }
    }

    #[must_use]
    pub fn with_keep_warm(mut self, keep_warm: bool) -> Self {
        self.keep_warm = keep_warm;
        self
    }

    /// Whether the include filter admits `tool`.
    pub fn includes_tool(&self, tool: &str) -> bool {
        self.include_tools.is_empty() || self.include_tools.iter().any(|t| t == tool)
    }

    /// Hex SHA-256 over every field that requires a reconnect when changed.
    ///
    /// `include_tools`, `keep_warm` and `requires_auth` are bookkeeping and
    /// deliberately left out.
    pub fn identity_signature(&self) -> String {
        let mut hasher = Sha256::new();
        let mut feed = |label: &str, value: &str| {
            hasher.update(label.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        };

        feed("kind", self.connection.kind());
        match &self.connection {
            ConnectionParams::Local {
                command,
                args,
                cwd,
                env,
            } => {
                feed("command", command);
                for arg in args {
                    feed("arg", arg);
                }
                if let Some(cwd) = cwd {
                    feed("cwd", &cwd.to_string_lossy());
                }
                for (key, value) in env {
                    feed("env.key", key);
                    feed("env.value", value);
                }
            },
            ConnectionParams::Remote { url, headers } => {
                feed("url", url);
                for (key, value) in headers {
                    feed("header.key", key);
                    feed("header.value", value);
                }
            },
        }

        format!("{:x}", hasher.finalize())
    }
}
