use thiserror::Error;

use crate::capability::CapabilityAxis;

#[derive(Error, Debug)]
pub enum XenhostError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No baseline behavior registered for capability {axis:?}")]
    MissingCapabilityDefault { axis: CapabilityAxis },

    #[error("Unknown release '{release}'")]
    UnknownRelease { release: String },

    #[error("Unsupported hypervisor version {version}")]
    UnsupportedVersion { version: String },

    #[error("{feature} is not supported on release {release}")]
    Unsupported { feature: String, release: String },

    #[error("Remote call '{operation}' failed: {message}")]
    RemoteCall { operation: String, message: String },

    #[error("Authentication failed for {host}")]
    AuthenticationFailed { host: String },

    #[error("All credentials for {host} were rejected")]
    CredentialsExhausted { host: String },

    #[error("Task '{operation}' failed: {detail}")]
    TaskFailed { operation: String, detail: String },

    #[error("Task '{operation}' was cancelled")]
    TaskCancelled { operation: String },

    #[error("Operation timed out: {operation} after {duration:?}, outcome unknown")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Inconsistent state: {message}")]
    Inconsistency { message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    /// Keeps the underlying error so its kind survives the wrapping
    #[error("Migration of {subject} failed during {stage}: {source}")]
    MigrationFailed {
        subject: String,
        stage: String,
        #[source]
        source: Box<XenhostError>,
    },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Coarse classification used when turning errors into answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    RemoteCall,
    Timeout,
    Inconsistency,
    Unsupported,
    Internal,
}

impl XenhostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            XenhostError::ConfigError(_)
            | XenhostError::MissingCapabilityDefault { .. }
            | XenhostError::UnknownRelease { .. }
            | XenhostError::UnsupportedVersion { .. }
            | XenhostError::InvalidInput { .. }
            | XenhostError::TomlError(_) => ErrorKind::Configuration,
            XenhostError::RemoteCall { .. }
            | XenhostError::AuthenticationFailed { .. }
            | XenhostError::CredentialsExhausted { .. }
            | XenhostError::TaskFailed { .. }
            | XenhostError::TaskCancelled { .. }
            | XenhostError::IoError(_) => ErrorKind::RemoteCall,
            XenhostError::Timeout { .. } => ErrorKind::Timeout,
            XenhostError::Inconsistency { .. } | XenhostError::NotFound { .. } => {
                ErrorKind::Inconsistency
            }
            XenhostError::MigrationFailed { source, .. } => source.kind(),
            XenhostError::Unsupported { .. } => ErrorKind::Unsupported,
            XenhostError::Internal { .. } | XenhostError::JsonError(_) => ErrorKind::Internal,
        }
    }

    pub fn remote(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        XenhostError::RemoteCall {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        XenhostError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn inconsistency(message: impl Into<String>) -> Self {
        XenhostError::Inconsistency {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        XenhostError::Internal {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, XenhostError>;
pub type XenhostResult<T> = std::result::Result<T, XenhostError>;
