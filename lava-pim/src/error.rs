//! Error types for the process information manager

#[derive(Debug, thiserror::Error)]
pub enum PimError {
    #[error("cannot scan processes: {0}")]
    Scan(String),
    #[error("malformed snapshot {path}: {reason}")]
    Snapshot { path: String, reason: String },
    #[error("refresh protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, PimError>;
