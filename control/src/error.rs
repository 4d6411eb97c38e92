use thiserror::Error;

/// EdgeSync control plane errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    /// Watch checkpoint is too old for the API server (HTTP 410)
    #[error("watch expired: {0}")]
    WatchExpired(String),

    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    #[error("routing document error: {0}")]
    Document(#[from] common::DocumentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store writer is no longer running")]
    StoreClosed,
}

impl SyncError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
