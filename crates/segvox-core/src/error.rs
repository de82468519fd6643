//! Error types for the segvox crates.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Illegal combination of compression options
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Volume data does not match the declared dimensions
    #[error("invalid input shape: {0}")]
    InputShape(String),

    /// A split encoding vector outgrew the 32 bit index space
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, unsupported version, or inconsistent length prefixes
    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    /// Post-encode invariants do not hold
    #[error("verification failed: {0}")]
    VerificationFailed(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
