//! Error types shared by the Haggle value types

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while constructing or serializing value types
#[derive(Debug, Error)]
pub enum Error {
    /// An argument violated a contract precondition
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Malformed metadata document
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Base64 decoding failed
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// File or socket operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An identifier had the wrong length or format
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A bloom filter could not be decoded
    #[error("bloomfilter error: {0}")]
    Bloomfilter(String),
}
