use std::error::Error as StdError;
use std::fmt::Write;

use thiserror::Error;

/// An error produced by a cached call, or routed to the [`ErrorSink`](super::ErrorSink).
///
/// The details are rendered error chains, which makes the error cheap to clone and to hand out to
/// any number of sink subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The controller or a registration was set up with invalid options.
    ///
    /// This is raised by construction and registration, never by a cached call.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The call arguments could not be turned into a cache key.
    #[error("failed to resolve cache key: {0}")]
    KeyResolution(String),
    /// The wrapped operation failed while the caller was waiting for it.
    ///
    /// These results are never written to the storage.
    #[error("operation failed: {0}")]
    Operation(String),
    /// Looking up an entry in the storage failed.
    #[error("storage read failed: {0}")]
    StorageRead(String),
    /// Writing or deleting entries in the storage failed.
    ///
    /// For detached writes this is only ever observable through the error sink.
    #[error("storage write failed: {0}")]
    StorageWrite(String),
    /// The wrapped operation failed while refreshing an entry ahead of its expiry.
    ///
    /// The stale value handed out before stays valid until it expires naturally.
    #[error("background refresh failed: {0}")]
    BackgroundRefresh(String),
}

impl CacheError {
    /// A short, stable name of the variant, used to tag metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::KeyResolution(_) => "key_resolution",
            Self::Operation(_) => "operation",
            Self::StorageRead(_) => "storage_read",
            Self::StorageWrite(_) => "storage_write",
            Self::BackgroundRefresh(_) => "background_refresh",
        }
    }

    pub(crate) fn configuration(context: &str, err: &(dyn StdError + 'static)) -> Self {
        Self::Configuration(format!("{context}: {}", render_chain(err)))
    }

    pub(crate) fn storage_read(err: &(dyn StdError + 'static)) -> Self {
        Self::StorageRead(render_chain(err))
    }

    pub(crate) fn storage_write(err: &(dyn StdError + 'static)) -> Self {
        Self::StorageWrite(render_chain(err))
    }

    pub(crate) fn operation(err: &anyhow::Error) -> Self {
        Self::Operation(format!("{err:#}"))
    }

    pub(crate) fn background_refresh(err: &anyhow::Error) -> Self {
        Self::BackgroundRefresh(format!("{err:#}"))
    }
}

/// Renders an error and all of its sources as `outer: inner: innermost`.
fn render_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        // writing into a `String` does not fail
        let _ = write!(rendered, ": {err}");
        source = err.source();
    }
    rendered
}
