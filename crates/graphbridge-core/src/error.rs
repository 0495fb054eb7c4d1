/// Error codes understood by the serving framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Unsupported,
    Unavailable,
    InvalidArgument,
    Internal,
}

/// Errors raised by the execution bridge. Cloned into every response when a
/// whole batch fails.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal: {0}")]
    Internal(String),

    /// The engine itself failed.
    #[error("engine error while {context}: {message}")]
    Engine { context: String, message: String },
}

impl BridgeError {
    pub fn engine(context: impl Into<String>, err: anyhow::Error) -> Self {
        BridgeError::Engine {
            context: context.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Unsupported(_) => ErrorKind::Unsupported,
            BridgeError::Unavailable(_) => ErrorKind::Unavailable,
            BridgeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BridgeError::Internal(_) | BridgeError::Engine { .. } => ErrorKind::Internal,
        }
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
