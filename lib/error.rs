use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an unlayer-related operation.
pub type UnlayerResult<T> = Result<T, UnlayerError>;

/// An error that occurred while applying a layer diff.
#[derive(Debug, Error)]
pub enum UnlayerError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A malformed or truncated archive entry was read from the layer stream.
    #[error("malformed archive stream: {0}")]
    Stream(std::io::Error),

    /// An entry name resolved to a location outside the destination root.
    #[error("entry {name:?} is outside of destination {dest:?}")]
    Breakout {
        /// The offending entry name as it appeared in the archive.
        name: String,

        /// The destination root the entry tried to escape.
        dest: String,
    },

    /// A hardlink pointed into the AUFS link directory but no staged source
    /// was captured for it earlier in the stream.
    #[error("invalid aufs hardlink: no staged source for {0:?}")]
    InvalidHardlink(String),

    /// A filesystem operation failed while processing an entry.
    #[error("failed to process entry {path}: {source}")]
    EntryHandling {
        /// The underlying filesystem error.
        source: std::io::Error,

        /// The destination path being processed.
        path: String,
    },

    /// The configured UID/GID mapping is malformed or does not cover an id.
    #[error("invalid id mapping: {0}")]
    IdMapping(String),

    /// The layer stream uses a compression format this crate cannot decode.
    #[error("unsupported compression format: {0}")]
    UnsupportedCompression(String),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnlayerError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> UnlayerError {
        UnlayerError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps a filesystem error with the destination path it occurred on.
    pub fn entry(source: std::io::Error, path: impl Display) -> UnlayerError {
        UnlayerError::EntryHandling {
            source,
            path: path.to_string(),
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `UnlayerResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> UnlayerResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
