//! Error types for qbridge.
//!
//! Errors come in two severities. Fatal errors end the connection: the
//! transport is closed and the error is reported once to whoever drives
//! processing. Everything else is a warning that skips one command.

use thiserror::Error;

/// Main error type for the qbridge engine.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection closed by peer")]
    Disconnected,

    #[error("Connection is closed")]
    Closed,

    #[error("Invalid frame: {message}")]
    Framing { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Protocol errors
    #[error("Unknown command {command}")]
    UnknownCommand { command: String },

    #[error("Malformed {command} message: {message}")]
    MalformedMessage { command: String, message: String },

    #[error("{action} of unknown object {identifier}")]
    UnknownObject { action: String, identifier: String },

    #[error("Object identifier {identifier} is already in use")]
    DuplicateIdentifier { identifier: String },

    #[error("Create of unknown type {type_name}")]
    UnknownType { type_name: String },

    // Type errors
    #[error("Type '{type_name}' is invalid: {message}")]
    TypeDefinition { type_name: String, message: String },

    #[error("Type '{type_name}' cannot be registered: {message}")]
    TypeRegistration { type_name: String, message: String },

    #[error("Marshal of object {identifier} failed: {message}")]
    Marshal { identifier: String, message: String },

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for qbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure of a single method invocation.
///
/// Invocation failures are never fatal for the connection.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("method {method} does not exist")]
    UnknownMethod { method: String },

    #[error("wrong number of arguments for {method}; expected {expected}, provided {provided}")]
    ArgumentCount {
        method: String,
        expected: usize,
        provided: usize,
    },

    #[error("wrong type for argument {index} to {method}; expected {expected}, {message}")]
    ArgumentType {
        method: String,
        index: usize,
        expected: String,
        message: String,
    },

    #[error("{0}")]
    Failed(anyhow::Error),
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BridgeError {
    pub(crate) fn framing(message: impl Into<String>) -> Self {
        BridgeError::Framing {
            message: message.into(),
        }
    }

    pub(crate) fn type_definition(type_name: &str, message: impl Into<String>) -> Self {
        BridgeError::TypeDefinition {
            type_name: type_name.to_string(),
            message: message.into(),
        }
    }

    /// Check if this error terminates the connection when it happens while
    /// processing a command.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BridgeError::Invoke(_) | BridgeError::Marshal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::UnknownObject {
            action: "query".into(),
            identifier: "abc".into(),
        };
        assert_eq!(err.to_string(), "query of unknown object abc");

        let err = InvokeError::ArgumentCount {
            method: "add".into(),
            expected: 1,
            provided: 2,
        };
        assert_eq!(
            err.to_string(),
            "wrong number of arguments for add; expected 1, provided 2"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BridgeError::Disconnected.is_fatal());
        assert!(BridgeError::UnknownCommand {
            command: "NOPE".into()
        }
        .is_fatal());
        assert!(!BridgeError::Invoke(InvokeError::UnknownMethod {
            method: "missing".into()
        })
        .is_fatal());
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: BridgeError = io.into();
        assert!(matches!(err, BridgeError::Io { source: Some(_), .. }));
    }
}
