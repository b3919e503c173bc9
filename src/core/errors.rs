//! CMR-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Top-level error type for the content mirror.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("[CMR-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CMR-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CMR-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CMR-2001] index format error at line {line} ({section}): {details}")]
    IndexFormat {
        line: usize,
        section: &'static str,
        details: String,
    },

    #[error("[CMR-2002] invalid checksum {checksum:?}: {details}")]
    InvalidChecksum { checksum: String, details: String },

    #[error("[CMR-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CMR-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[CMR-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CMR-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[CMR-3101] transport failure with {peer}: {details}")]
    Transport { peer: String, details: String },

    #[error("[CMR-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl MirrorError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CMR-1001",
            Self::MissingConfig { .. } => "CMR-1002",
            Self::ConfigParse { .. } => "CMR-1003",
            Self::IndexFormat { .. } => "CMR-2001",
            Self::InvalidChecksum { .. } => "CMR-2002",
            Self::Serialization { .. } => "CMR-2101",
            Self::PermissionDenied { .. } => "CMR-3001",
            Self::Io { .. } => "CMR-3002",
            Self::ChannelClosed { .. } => "CMR-3003",
            Self::Transport { .. } => "CMR-3101",
            Self::Runtime { .. } => "CMR-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Corrupted persisted state and misconfiguration never are.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Transport { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for transport errors.
    #[must_use]
    pub fn transport(peer: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Self::Transport {
            peer: peer.into(),
            details: details.to_string(),
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for MirrorError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<bincode::Error> for MirrorError {
    fn from(value: bincode::Error) -> Self {
        Self::Serialization {
            context: "bincode",
            details: value.to_string(),
        }
    }
}
