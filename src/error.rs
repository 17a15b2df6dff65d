//! Typed errors callers branch on. Everything else travels as `anyhow::Error`.

use std::path::PathBuf;

/// Catalog, profile and settings problems. Fatal at load: the case never starts watching.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("module descriptor not found: {name} (searched {})", .dir.display())]
    ModuleNotFound { name: String, dir: PathBuf },

    #[error("profile not found: {name} (searched {})", .dir.display())]
    ProfileNotFound { name: String, dir: PathBuf },

    #[error("read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("module {module}: {reason}")]
    InvalidModule { module: String, reason: String },

    #[error("module {module}: invalid regex {pattern:?}: {source}")]
    Regex {
        module: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("selected modules target different operating systems: {0}")]
    MixedOs(String),

    #[error("{0}")]
    Invalid(String),
}

/// A trigger that could not be handed to the broker.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("record task for {module}: {source}")]
    Record {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("encode task for {module}: {source}")]
    Encode {
        module: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("enqueue {module} on {queue}: {source}")]
    Enqueue {
        module: String,
        queue: String,
        #[source]
        source: anyhow::Error,
    },
}
