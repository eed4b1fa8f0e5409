//! Error handling for the Modbus master gateway
//!
//! Configuration errors are surfaced synchronously to the caller of an
//! operation. Transport errors stay inside the connection and device
//! boundary and only reach the caller as the result of an explicit write.

use thiserror::Error;

use crate::core::transport::TransportError;

/// Gateway error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    /// Rejected configuration input (invalid transport kind, malformed parameters)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection, device or point not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Name collision among siblings
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation requires a live transport handle
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Transport adapter failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persisted state could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The connection actor has exited (removed or shut down)
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, MasterError>;

impl MasterError {
    pub fn config(msg: impl Into<String>) -> Self {
        MasterError::Config(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        MasterError::Persistence(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        MasterError::Internal(msg.into())
    }

    // Convenience constructors for specific cases
    pub fn connection_not_found(name: impl std::fmt::Display) -> Self {
        MasterError::NotFound(format!("connection '{}'", name))
    }

    pub fn device_not_found(name: impl std::fmt::Display) -> Self {
        MasterError::NotFound(format!("device '{}'", name))
    }

    pub fn point_not_found(name: impl std::fmt::Display) -> Self {
        MasterError::NotFound(format!("point '{}'", name))
    }

    pub fn already_exists(what: &str, name: impl std::fmt::Display) -> Self {
        MasterError::AlreadyExists(format!("{} '{}'", what, name))
    }

    pub fn not_connected(connection: impl std::fmt::Display) -> Self {
        MasterError::NotConnected(format!("connection '{}' has no live handle", connection))
    }

    pub fn connection_closed(connection: impl std::fmt::Display) -> Self {
        MasterError::ConnectionClosed(format!("connection '{}'", connection))
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<TransportError> for MasterError {
    fn from(err: TransportError) -> Self {
        MasterError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for MasterError {
    fn from(err: std::io::Error) -> Self {
        MasterError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for MasterError {
    fn from(err: serde_json::Error) -> Self {
        MasterError::Persistence(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for MasterError {
    fn from(err: serde_yaml::Error) -> Self {
        MasterError::Persistence(format!("YAML: {err}"))
    }
}

impl From<common::Error> for MasterError {
    fn from(err: common::Error) -> Self {
        MasterError::Config(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_constructor_messages() {
        assert_eq!(
            MasterError::connection_not_found("plc1").to_string(),
            "Not found: connection 'plc1'"
        );
        assert_eq!(
            MasterError::already_exists("device", "meter").to_string(),
            "Already exists: device 'meter'"
        );
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: MasterError = TransportError::Timeout("slave 3".into()).into();
        assert!(matches!(err, MasterError::Transport(msg) if msg.contains("slave 3")));
    }
}
