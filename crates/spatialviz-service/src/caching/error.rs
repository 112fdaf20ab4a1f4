use thiserror::Error;

use crate::plotting::PlottingError;

/// An error that happens while producing or serving a rendered image.
///
/// Every caller waiting on the same render receives a clone of the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// The request is malformed, for example an empty gene or dataset.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The plotting backend could not produce the image.
    #[error(transparent)]
    Plotting(#[from] PlottingError),
    /// The cache index and the files on disk disagree.
    ///
    /// The affected key is purged from the cache, and a later request renders it anew.
    #[error("cache store corrupted: {0}")]
    StoreCorruption(String),
    /// A cache file could not be deleted.
    ///
    /// The entry stays in the index and keeps counting towards the cache size until a later
    /// eviction pass manages to delete it.
    #[error("failed to evict cache entry: {0}")]
    EvictionFailure(String),
    /// An unexpected error in spatialviz itself, such as a failing temp file.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for RenderError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for RenderError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl RenderError {
    /// Logs the given error and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short, stable name of the error kind, used for metric tags.
    pub fn as_tag(&self) -> &'static str {
        match self {
            RenderError::InvalidRequest(_) => "invalid_request",
            RenderError::Plotting(_) => "plotting",
            RenderError::StoreCorruption(_) => "store_corruption",
            RenderError::EvictionFailure(_) => "eviction_failure",
            RenderError::InternalError => "internal",
        }
    }
}
