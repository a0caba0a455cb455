//! Certificate Revocation List (CRL) rewriting
//!
//! Revoked entries are added to and removed from an existing DER encoded CRL
//! without decoding the whole list, and the result is re-signed.
//!
//! # Features
//! - Streaming two pass rewrite with length re-computation
//! - CRL number increment and authority key identifier refresh
//! - Signing algorithm and key size changes
//! - Lazy iteration over revoked entries
//! - Building fresh CRLs and maintaining CRL files in DER or PEM form

mod builder;
pub mod der;
mod entry;
mod errors;
pub mod extensions;
mod file;
mod layout;
mod scanner;
pub mod time;
mod verify;
mod writer;

// Re-export public types
pub use builder::CrlBuilder;
pub use entry::{CrlEntryStream, CrlEntryValidator, CrlReason, RevokedEntry};
pub use errors::{CrlError, CrlResult, StateError};
pub use file::{CrlFile, issuer_from_certificate, to_pem};
pub use layout::{LengthCascade, NodeId};
pub use scanner::{CrlScanner, TbsPrefix, Trailer};
pub use verify::{CrlSummary, verify_signature};
pub use writer::{CrlSource, CrlStreamWriter, NextUpdatePolicy};
