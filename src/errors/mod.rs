//! # Error Handling
//!
//! This module provides comprehensive error handling for the Meshplane control plane.
//! It defines custom error types using `thiserror` for all operations.

pub mod tls;

pub use tls::TlsError;

/// Custom result type for Meshplane operations
pub type Result<T> = std::result::Result<T, MeshplaneError>;

/// Short alias used throughout the crate
pub type Error = MeshplaneError;

/// Main error type for the Meshplane control plane
#[derive(thiserror::Error, Debug)]
pub enum MeshplaneError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// xDS protocol errors
    #[error("xDS protocol error: {message}")]
    Xds { message: String, node_id: Option<String> },

    /// Snapshot failed the xDS consistency predicate and must not be published
    #[error("Inconsistent snapshot: {message}")]
    InconsistentSnapshot { message: String },

    /// Malformed parameter entry: no separator between name and value
    #[error("Unable to find separator to load parameter '{key}'")]
    SeparatorNotFound { key: String },

    /// Malformed parameter entry: value did not parse into a parameter URI
    #[error("Invalid parameter type for '{key}'")]
    InvalidParameterType {
        key: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Blob storage has no object for this parameter
    #[error("File not found for parameter '{key}'")]
    FileNotFound { key: String },

    /// `load` was invoked on a parameter that is not of kind `file`
    #[error("Load method applies only for parameter kind 'file'")]
    LoadOnlyFileType,

    /// A parameter URI carried a scheme the control plane does not know
    #[error("Unknown parameter scheme '{scheme}'")]
    UnknownScheme { scheme: String },

    /// TLS account / certificate errors
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Domain registry errors (hosted zone lookups, record changes)
    #[error("Domain registry error: {message}")]
    DomainRegistry { message: String },

    /// Internal server errors
    #[error("Internal server error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Network transport errors (gRPC, HTTP)
    #[error("Transport error: {0}")]
    Transport(String),
}

impl MeshplaneError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create an xDS protocol error
    pub fn xds<S: Into<String>>(message: S) -> Self {
        Self::Xds { message: message.into(), node_id: None }
    }

    /// Create an xDS protocol error with node ID
    pub fn xds_with_node<S: Into<String>, N: Into<String>>(message: S, node_id: N) -> Self {
        Self::Xds { message: message.into(), node_id: Some(node_id.into()) }
    }

    /// Create an inconsistent-snapshot error
    pub fn inconsistent_snapshot<S: Into<String>>(message: S) -> Self {
        Self::InconsistentSnapshot { message: message.into() }
    }

    /// Create a file-not-found error for a parameter key
    pub fn file_not_found<S: Into<String>>(key: S) -> Self {
        Self::FileNotFound { key: key.into() }
    }

    /// Create a domain registry error
    pub fn domain_registry<S: Into<String>>(message: S) -> Self {
        Self::DomainRegistry { message: message.into() }
    }

    /// Create an internal server error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Create an internal server error with source
    pub fn internal_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(source) }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Check if this error should be retried on the next discovery cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshplaneError::Io { .. }
                | MeshplaneError::Timeout { .. }
                | MeshplaneError::Transport(_)
                | MeshplaneError::InconsistentSnapshot { .. }
        )
    }
}

// Error conversions for common external error types
impl From<std::io::Error> for MeshplaneError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for MeshplaneError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<config::ConfigError> for MeshplaneError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<url::ParseError> for MeshplaneError {
    fn from(error: url::ParseError) -> Self {
        Self::Validation { message: format!("Invalid URI: {}", error), field: None }
    }
}

impl From<validator::ValidationErrors> for MeshplaneError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = MeshplaneError::config("Test configuration error");
        assert!(matches!(error, MeshplaneError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: Test configuration error");
    }

    #[test]
    fn test_parameter_errors_render_key() {
        let error = MeshplaneError::file_not_found("TLS_ACCOUNT");
        assert_eq!(error.to_string(), "File not found for parameter 'TLS_ACCOUNT'");

        let error = MeshplaneError::UnknownScheme { scheme: "s3".into() };
        assert_eq!(error.to_string(), "Unknown parameter scheme 's3'");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(MeshplaneError::timeout("cycle", 1000).is_retryable());
        assert!(MeshplaneError::inconsistent_snapshot("dangling route").is_retryable());
        assert!(!MeshplaneError::validation("test").is_retryable());
        assert!(!MeshplaneError::LoadOnlyFileType.is_retryable());
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MeshplaneError = io_error.into();
        assert!(matches!(err, MeshplaneError::Io { .. }));

        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: MeshplaneError = json_error.into();
        assert!(matches!(err, MeshplaneError::Serialization { .. }));
    }
}
