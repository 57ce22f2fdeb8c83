use bundler_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Upstream(#[from] bundler_mcp::Error),
    #[error("no snapshot available for project '{project}'")]
    SnapshotUnavailable { project: String },
    #[error("upstream '{alias}' is already registered")]
    DuplicateAlias { alias: String },
    #[error("unknown upstream '{alias}'")]
    UnknownAlias { alias: String },
    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

bundler_common::impl_context!();
