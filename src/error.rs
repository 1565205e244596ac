//! Error types for the daemon.

use thiserror::Error;

/// Startup/rehash configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Fatal server-link protocol violations. The display text is what the
/// peer sees in the closing `ERROR` line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Unknown source {0}")]
    UnknownSource(String),

    #[error("Invalid identifier {0}")]
    InvalidId(String),

    #[error("SID {0} already in use")]
    SidClash(String),

    #[error("Missing required capability {0}")]
    MissingCapab(String),

    #[error("Duplicate GCAP from {0}")]
    DuplicateGcap(String),

    #[error("Invalid SQUIT target {0}")]
    BadSquit(String),

    #[error("{0}")]
    Violation(String),
}
