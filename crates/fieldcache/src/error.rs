use std::io;

use thiserror::Error;

/// Errors surfaced by the [`FieldCache`](crate::FieldCache) and its disk store.
///
/// Disk related failures during the periodic sync or the startup load are logged and
/// swallowed. They only reach callers through explicit calls like
/// [`FieldCache::flush`](crate::FieldCache::flush) or
/// [`FieldCache::clear_all`](crate::FieldCache::clear_all).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The fetcher failed. The error is passed through unchanged and nothing is retried.
    #[error("fetch failed")]
    Fetch(#[source] anyhow::Error),
    /// Reading or writing snapshot files failed.
    #[error("snapshot io failed")]
    Io(#[from] io::Error),
    /// A snapshot envelope or an inline field value could not be (de)serialized.
    #[error("snapshot json is invalid")]
    Json(#[from] serde_json::Error),
    /// A value of the wrong type was written into a field slot.
    #[error("field `{field}` expects a value of type `{expected}`")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },
    /// A binary type handler failed to encode or decode a field value.
    #[error("binary handler for field `{field}` failed")]
    Codec {
        field: &'static str,
        #[source]
        source: io::Error,
    },
    /// A snapshot references data that is not there or does not fit the field.
    #[error("malformed snapshot: {0}")]
    Malformed(String),
}

/// Shorthand for results produced by this crate.
pub type CacheResult<T = ()> = Result<T, CacheError>;
