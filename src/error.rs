/// Error handling for the ACME engine
use thiserror::Error;

/// Result type for ACME operations
pub type Result<T> = std::result::Result<T, AcmeError>;

/// Error types for ACME operations
#[derive(Error, Debug)]
pub enum AcmeError {
    /// Protocol-level error (unexpected status, missing header, bad shape)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JOSE error (JWS form, signature, JWK members)
    #[error("JOSE error: {0}")]
    Jose(String),

    /// CSR defect (subject, attributes, SAN types)
    #[error("CSR error: {0}")]
    Csr(String),

    /// Certificate issuance or inspection error
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Cryptographic operation error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// HTTP transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Identifier validation failed
    #[error("Validation failed: {challenge_type}, error: {error}")]
    Validation {
        challenge_type: String,
        error: String,
    },

    /// Rate limited by the server
    #[error("Rate limited, retry after: {0:?}")]
    RateLimited(Option<std::time::Duration>),

    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AcmeError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        AcmeError::Protocol(msg.into())
    }

    /// Create a JOSE error
    pub fn jose<S: Into<String>>(msg: S) -> Self {
        AcmeError::Jose(msg.into())
    }

    /// Create a CSR error
    pub fn csr<S: Into<String>>(msg: S) -> Self {
        AcmeError::Csr(msg.into())
    }

    /// Create a certificate error
    pub fn certificate<S: Into<String>>(msg: S) -> Self {
        AcmeError::Certificate(msg.into())
    }

    /// Create a crypto error
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        AcmeError::Crypto(msg.into())
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        AcmeError::Transport(msg.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(challenge_type: S, error: S) -> Self {
        AcmeError::Validation {
            challenge_type: challenge_type.into(),
            error: error.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        AcmeError::InvalidInput(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        AcmeError::Timeout(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        AcmeError::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        AcmeError::Configuration(msg.into())
    }
}
