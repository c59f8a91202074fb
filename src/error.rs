use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Connection error ({host}): {message}")]
    Connection { host: String, message: String },

    #[error("Authentication error ({host}): {message}")]
    Auth { host: String, message: String },

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid resource: {0}")]
    Resource(String),

    #[error("Transfer of {path} failed after {transferred} bytes: {source}")]
    PartialTransfer {
        path: String,
        transferred: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{operation} on host {host_id} failed: {source}")]
    Context {
        host_id: String,
        operation: &'static str,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Wrap a fatal error with the host and the operation that produced it.
    pub fn context(self, host_id: impl Into<String>, operation: &'static str) -> Self {
        match self {
            // Already carries context
            EngineError::Context { .. } => self,
            other => EngineError::Context {
                host_id: host_id.into(),
                operation,
                source: Box::new(other),
            },
        }
    }

    /// Machine readable error code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Connection { .. } => "CONNECTION_ERROR",
            EngineError::Auth { .. } => "AUTH_ERROR",
            EngineError::Timeout { .. } => "TIMEOUT",
            EngineError::Protocol(_) => "PROTOCOL_ERROR",
            EngineError::Resource(_) => "RESOURCE_ERROR",
            EngineError::PartialTransfer { .. } => "PARTIAL_TRANSFER",
            EngineError::Ssh(_) => "SSH_ERROR",
            EngineError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            EngineError::SessionClosed(_) => "SESSION_CLOSED",
            EngineError::HostNotFound(_) => "HOST_NOT_FOUND",
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::Io(_) => "IO_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
            EngineError::Context { source, .. } => source.code(),
        }
    }

    /// Bytes moved before a transfer failed, if this error came from one.
    pub fn transferred_bytes(&self) -> Option<u64> {
        match self {
            EngineError::PartialTransfer { transferred, .. } => Some(*transferred),
            EngineError::Context { source, .. } => source.transferred_bytes(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            EngineError::Timeout { .. } => true,
            EngineError::Context { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Serializable error for collaborators
#[derive(Debug, Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl From<&EngineError> for SerializableError {
    fn from(err: &EngineError) -> Self {
        let (host_id, operation, message) = match err {
            EngineError::Context {
                host_id,
                operation,
                source,
            } => (
                Some(host_id.clone()),
                Some(operation.to_string()),
                crate::logging::sanitize(&source.to_string()),
            ),
            // Auth details stay in the logs
            EngineError::Auth { host, .. } => {
                (None, None, format!("Authentication failed for {}", host))
            }
            other => (None, None, crate::logging::sanitize(&other.to_string())),
        };

        SerializableError {
            code: err.code().to_string(),
            message,
            host_id,
            operation,
        }
    }
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<ssh2::Error> for EngineError {
    fn from(err: ssh2::Error) -> Self {
        EngineError::Ssh(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(err: toml::ser::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Protocol(format!("Background task failed: {}", err))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
