//! Error types for the otpguard service.
//!
//! Rate limit denials are not errors; they are reported through
//! [`RateLimitDecision`](crate::ratelimit::RateLimitDecision).

use thiserror::Error;

/// Main error type for otpguard operations.
#[derive(Error, Debug)]
pub enum OtpGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid identifier or purpose supplied by a caller
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for OtpGuardError {
    fn from(err: config::ConfigError) -> Self {
        OtpGuardError::Config(err.to_string())
    }
}

/// Result type alias for otpguard operations.
pub type Result<T> = std::result::Result<T, OtpGuardError>;
