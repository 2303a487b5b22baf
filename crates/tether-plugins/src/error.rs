use std::path::PathBuf;
use std::time::Duration;

use tether_core::errors::TransportError;

/// Errors from loading or running plugins.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("script exited with status {status}: {stderr}")]
    ScriptFailed { status: i32, stderr: String },

    #[error("script timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("unknown handler {name:?} in {path}")]
    UnknownHandler { name: String, path: PathBuf },

    #[error("invalid pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("not a plugin file: {0}")]
    Ineligible(PathBuf),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl PluginError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
