use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to callers of the bridge.
///
/// Only failures that abort a caller-visible operation are represented here.
/// Reconciliation and post-integration failures are logged and swallowed so a
/// single bad event cannot tear down the binding.
#[derive(Debug, Error)]
pub enum Error {
    /// A value cannot be represented in the document.
    ///
    /// Raised synchronously at write time, before anything touches the doc,
    /// so the triggering burst can be rolled back.
    #[error("unsupported value at {path}: {reason}")]
    UnsupportedValue {
        /// Path of the offending node within the written value.
        path: String,
        /// Why the node was rejected.
        reason: &'static str,
    },
    /// An encoded update could not be decoded or applied.
    #[error("update could not be applied: {0}")]
    Apply(String),
    /// The binding was disposed.
    #[error("binding was disposed")]
    Disposed,
}

impl Error {
    pub(crate) fn unsupported(path: impl Into<String>, reason: &'static str) -> Self {
        Self::UnsupportedValue {
            path: path.into(),
            reason,
        }
    }
}
