use {bundler_common::FromMessage, bundler_mcp::LifecycleError};

/// JSON-RPC error codes the router emits beyond the standard set.
pub mod codes {
    pub const RESTARTING: i64 = -32001;
    pub const UPSTREAM: i64 = -32002;
}

/// Every failure a routed request can end in. Always reported to the
/// caller of that request, never past it.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("unknown {kind} '{name}'")]
    UnknownTarget { kind: &'static str, name: String },
    #[error("upstream '{alias}' is restarting, retry shortly")]
    Restarting { alias: String },
    #[error("upstream '{alias}' failed: {message}")]
    Upstream { alias: String, message: String },
    #[error("cannot reach upstream '{alias}': {reason}")]
    Connection { alias: String, reason: String },
    #[error("upstream '{alias}' is misconfigured: {reason}")]
    Configuration { alias: String, reason: String },
    #[error("no capability snapshot is available yet")]
    SnapshotUnavailable,
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("path '{path}' is outside the allowed temp directories")]
    PathNotAllowed { path: String },
    #[error("file '{path}' is {size} bytes, over the {limit} byte limit")]
    FileTooLarge { path: String, size: u64, limit: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Catalog(#[from] bundler_catalog::Error),
    #[error("{message}")]
    Message { message: String },
}

impl RouterError {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    pub fn unknown(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownTarget {
            kind,
            name: name.into(),
        }
    }

    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i64 {
        use bundler_mcp::types::error_codes;
        match self {
            Self::UnknownTarget { .. }
            | Self::InvalidParams(_)
            | Self::PathNotAllowed { .. }
            | Self::FileTooLarge { .. } => error_codes::INVALID_PARAMS,
            Self::Restarting { .. } => codes::RESTARTING,
            Self::Upstream { .. } | Self::Connection { .. } | Self::Configuration { .. } => {
                codes::UPSTREAM
            },
            Self::SnapshotUnavailable
            | Self::Io(_)
            | Self::SerdeJson(_)
            | Self::Catalog(_)
            | Self::Message { .. } => error_codes::INTERNAL_ERROR,
        }
    }

    pub fn from_lifecycle(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Configuration { alias, reason } => Self::Configuration { alias, reason },
            LifecycleError::UnknownAlias { alias } => Self::unknown("upstream", alias),
            LifecycleError::Stopped => Self::message("router is shutting down"),
            LifecycleError::CredentialsPending { alias } => Self::Connection {
                alias,
                reason: "waiting for credentials".into(),
            },
            LifecycleError::Connection { alias, reason } => Self::Connection { alias, reason },
            LifecycleError::ReadyTimeout { alias, secs } => Self::Connection {
                alias,
                reason: format!("not ready within {secs}s"),
            },
        }
    }
}

impl FromMessage for RouterError {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Error = RouterError;
pub type Result<T> = std::result::Result<T, RouterError>;

bundler_common::impl_context!();
