//! The error values that `rehook` hands back to its callers.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The object being patched has no property with the given name.
    #[error("patch target `{method}` does not exist")]
    TargetNotFound { method: String },

    /// The property exists, but it isn't something that can be called.
    #[error("patch target `{method}` is not a function")]
    NotCallable { method: String },

    /// A feature found its module but couldn't find what it needed inside it.
    #[error("unable to resolve target: {0}")]
    TargetUnresolved(String),

    /// Only ever logged. The cache retries on the next lookup.
    #[error("refresh of `{key}` failed: {reason}")]
    RefreshFailed { key: String, reason: String },

    #[error("invalid manifest at {path:?}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("`{0}` is not a valid theme name")]
    InvalidThemeName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
