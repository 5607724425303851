//! Error types for mcastmgrd
//!
//! Request-level failures never surface here: they are written back to the
//! client as negative errno statuses.

use thiserror::Error;

/// Multicast membership daemon errors
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mcastmgrd operations
pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaemonError::Configuration("socket_path is empty".to_string());
        assert_eq!(err.to_string(), "Configuration error: socket_path is empty");
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DaemonError = io.into();
        assert!(err.to_string().starts_with("IO error"));
    }
}
