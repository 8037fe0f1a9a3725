//! flashmla error types

/// flashmla result type
pub type Result<T> = std::result::Result<T, Error>;

/// flashmla errors
///
/// Every failure aborts the whole decode step for the batch. There is no
/// partial-batch success: callers retry or fall back to a non-split path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Malformed shape, count or non-positive size
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Inputs disagree with each other, or numerical corruption was detected
    /// while merging split results
    #[error("inconsistent state: {reason}")]
    Inconsistent {
        /// Description of what went wrong
        reason: String,
    },

    /// Fixed-capacity scheduling buffers cannot hold the requested work
    #[error("resource exhausted: {reason}")]
    ResourceExhausted {
        /// Description of what went wrong
        reason: String,
    },

    /// Configuration loading or validation error
    #[error("config error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },
}

impl Error {
    pub(crate) fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    pub(crate) fn inconsistent(reason: impl Into<String>) -> Self {
        Self::Inconsistent {
            reason: reason.into(),
        }
    }
}
