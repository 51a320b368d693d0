//! Error handling for the sha256d mining client
//!
//! Error types covering the work distribution engine, the kernel boundary and
//! the upstream connection, with a category for structured logging.

use thiserror::Error;

/// Result type alias for mining operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the mining client
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Malformed work from the server
    #[error("Work error: {message}")]
    Work { message: String },

    /// Target validation errors
    #[error("Invalid target: {message}")]
    Target { message: String },

    /// Kernel (compute plugin) errors
    #[error("Kernel error: {kernel}: {message}")]
    Kernel { kernel: String, message: String },

    /// JSON-RPC level errors returned by the server
    #[error("RPC error: {message}")]
    Rpc { message: String },

    /// Cancellation errors for async operations
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// Invalid state errors
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Unrecoverable condition reported through the kernel boundary
    #[error("Fatal error: {message}")]
    Fatal { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a work error
    pub fn work(message: impl Into<String>) -> Self {
        Self::Work {
            message: message.into(),
        }
    }

    /// Create a target error
    pub fn target(message: impl Into<String>) -> Self {
        Self::Target {
            message: message.into(),
        }
    }

    /// Create a kernel error
    pub fn kernel(kernel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kernel {
            kernel: kernel.into(),
            message: message.into(),
        }
    }

    /// Create an RPC error
    pub fn rpc(message: impl Into<String>) -> Self {
        Self::Rpc {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::Work { .. } => "work",
            Error::Target { .. } => "target",
            Error::Kernel { .. } => "kernel",
            Error::Rpc { .. } => "rpc",
            Error::Cancelled { .. } => "cancelled",
            Error::InvalidState { .. } => "invalid_state",
            Error::Fatal { .. } => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::config("x").category(), "config");
        assert_eq!(Error::kernel("cpu", "x").category(), "kernel");
        assert_eq!(Error::fatal("x").category(), "fatal");
    }

    #[test]
    fn test_display() {
        let err = Error::kernel("cpu", "THREADS must be positive");
        assert_eq!(err.to_string(), "Kernel error: cpu: THREADS must be positive");
    }
}
