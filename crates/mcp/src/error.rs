use std::error::Error as StdError;

use bundler_common::FromMessage;

/// Transport-level failures that callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum McpTransportError {
    #[error("upstream requires authorization")]
    Unauthorized { www_authenticate: Option<String> },
    #[error("transport closed: {reason}")]
    Closed { reason: String },
    #[error("request '{method}' timed out after {secs}s")]
    Timeout { method: String, secs: u64 },
    #[error("upstream error on '{method}': code={code} message={message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("upstream returned HTTP {status} for '{method}': {body}")]
    HttpStatus {
        method: String,
        status: u16,
        body: String,
    },
}

/// Connection lifecycle failures, isolated per alias.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Missing executable/URL; fatal to this attempt only.
    #[error("upstream '{alias}' is misconfigured: {reason}")]
    Configuration { alias: String, reason: String },
    /// Process spawn, handshake or network failure.
    #[error("failed to connect to upstream '{alias}': {reason}")]
    Connection { alias: String, reason: String },
    #[error("upstream '{alias}' did not become ready within {secs}s")]
    ReadyTimeout { alias: String, secs: u64 },
    #[error("upstream '{alias}' is waiting for credentials")]
    CredentialsPending { alias: String },
    #[error("unknown upstream '{alias}'")]
    UnknownAlias { alias: String },
    #[error("upstream manager is shutting down")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    #[error(transparent)]
    Transport(#[from] McpTransportError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True for failures of the connection itself rather than of one call.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Reqwest(_)
                | Self::Transport(McpTransportError::Closed { .. })
                | Self::Lifecycle(LifecycleError::Connection { .. })
        )
    }
}

impl Error {
    /// True when the root cause is a missing file or executable.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        let io = match self {
            Self::Io(e) => Some(e),
            Self::External { source, .. } => source.downcast_ref::<std::io::Error>(),
            _ => None,
        };
        io.is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

bundler_common::impl_context!();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_transport_is_connection_failure() {
        let err: Error = McpTransportError::Closed {
            reason: "stdout closed".into(),
        }
        .into();
        assert!(err.is_connection_failure());
    }

    #[test]
    fn rpc_error_is_not_connection_failure() {
        let err: Error = McpTransportError::Rpc {
            method: "tools/call".into(),
            code: -32000,
            message: "boom".into(),
        }
        .into();
        assert!(!err.is_connection_failure());
        assert!(err.to_string().contains("code=-32000"));
    }

    #[test]
    fn missing_executable_is_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert!(Error::external("failed to spawn upstream: nope", io).is_not_found());
        assert!(!Error::message("boom").is_not_found());
    }
}
