use openssl::error::ErrorStack;
use thiserror::Error;

pub type CryptoResult<T> = Result<T, Error>;

/// Error type for cryptographic operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid key material or parameters
    #[error("Invalid data: {0}")]
    Invalid(String),

    /// Signature algorithm that cannot be used with an RSA key
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Produced signature does not have the length implied by the key
    #[error("Signature length mismatch: expected {expected} bytes, got {actual}")]
    SignatureLength { expected: usize, actual: usize },

    /// Internal OpenSSL error
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),
}
