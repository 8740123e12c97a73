//! Error types and result aliases for ropecount.
//!
//! One taxonomy is shared by the KV layer, the sink layer, and the
//! compactor itself so that control-flow signals (an empty work set) and
//! real failures travel through the same channel.

/// The result type used throughout ropecount.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ropecount operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The queried set or hash-map has no members.
    ///
    /// This is an expected control-flow signal: the scheduler consumes it
    /// to detect a drained segment. It never escapes a `process` call.
    #[error("no item to process")]
    Empty,

    /// A hash-map key name does not conform to the codec.
    ///
    /// The offending member stays in its `_processing` set; clearing it is
    /// an operator action.
    #[error("malformed key: {message}")]
    Malformed {
        /// Description of what made the key malformed.
        message: String,
    },

    /// A KV or sink operation failed.
    ///
    /// The claim protocol rolls the in-flight member back so the next
    /// request can retry it.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The request was cancelled before the run finished.
    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Creates a new malformed-key error with the given message.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true for the "nothing here" signal.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}
