use thiserror::Error;

use crate::crypto::Error as CryptoError;

/// CRL-related errors
#[derive(Error, Debug)]
pub enum CrlError {
    /// Malformed, truncated or unsupported DER input
    #[error("CRL format error: {0}")]
    Format(String),

    /// Operation not valid for the current rewriter state
    #[error(transparent)]
    State(#[from] StateError),

    #[error("CRL signing failed: {0}")]
    Signing(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrlError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        CrlError::Format(msg.into())
    }
}

/// Misuse of the pre-scan / lock / write sequence
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Cannot modify a locked stream.")]
    AlreadyLocked,

    #[error("preScan has already been run.")]
    AlreadyPreScanned,

    #[error("The instance must be preScanned before it can be locked.")]
    NotPreScanned,

    #[error("The instance must be preScanned and locked before writing.")]
    NotLocked,

    #[error("The CRL has already been written; create a new writer for another rewrite.")]
    AlreadyWritten,
}

/// Convenient Result type alias
pub type CrlResult<T> = Result<T, CrlError>;
