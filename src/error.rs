use thiserror::Error;

/// Errors produced by the transfer engine
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    // ============================================================================
    // Lookup and State Errors
    // ============================================================================
    #[error("Transfer or favorite not found: {id}")]
    NotFound { id: String },

    #[error("Invalid state transition: {message}")]
    InvalidState { message: String },

    // ============================================================================
    // Network Errors
    // ============================================================================
    /// Peer cannot be reached: connect refused, probe timeout, protocol mismatch.
    #[error("Peer unreachable: {message}")]
    Unreachable { message: String },

    /// Recoverable network failure, eligible for retry.
    #[error("Transient network error: {message}")]
    Transient { message: String },

    // ============================================================================
    // Non-recoverable Errors
    // ============================================================================
    /// Disk full, permission denied, peer rejection mid-flight, protocol
    /// violation. Never retried.
    #[error("Fatal transfer error: {message}")]
    Fatal { message: String },

    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("Cannot bind port {port}: {message}")]
    BindFailure { port: u16, message: String },

    // ============================================================================
    // I/O and Serialization
    // ============================================================================
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serde JSON error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

impl EngineError {
    /// Create a not-found error for an unknown id
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create an invalid state error with a message
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState {
            message: msg.into(),
        }
    }

    /// Create an unreachable-peer error with a message
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable {
            message: msg.into(),
        }
    }

    /// Create a transient (retryable) error with a message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
        }
    }

    /// Create a fatal (non-retryable) error with a message
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
            message: msg.into(),
        }
    }

    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: msg.into(),
        }
    }

    /// Classify an HTTP client failure at the network boundary.
    ///
    /// Connect failures map to `Unreachable`; timeouts and mid-stream body
    /// errors are `Transient`. Anything else is also treated as transient so
    /// the retry budget, not the classification, bounds recovery.
    pub fn from_request(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unreachable {
                message: err.to_string(),
            }
        } else {
            Self::Transient {
                message: err.to_string(),
            }
        }
    }

    /// Classify a filesystem failure. Disk-full and permission errors are
    /// fatal; everything else stays a plain `Io` error.
    pub fn from_disk(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied | ErrorKind::StorageFull => Self::Fatal {
                message: err.to_string(),
            },
            _ => Self::Io { source: err },
        }
    }

    /// Whether this failure is eligible for retry under the retry policy
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
