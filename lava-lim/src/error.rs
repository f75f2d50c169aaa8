//! Error types for the load information manager

/// Errors surfaced by the LIM library
///
/// Transient collection failures never show up here: collectors log and
/// return sentinels instead. What remains are the failures a caller has to
/// act on.
#[derive(Debug, thiserror::Error)]
pub enum LimError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("ELIM protocol error: {0}")]
    Protocol(String),
    #[error("failed to start ELIM {program}: {reason}")]
    ProbeStart { program: String, reason: String },
    #[error("load index table full: cannot add {name} (max {max})")]
    IndexTableFull { name: String, max: usize },
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, LimError>;
