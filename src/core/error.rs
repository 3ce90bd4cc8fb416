//! Error type system for the extension engine
//!
//! This module provides:
//! - One error enum covering every failure kind of the loading pipeline
//! - Stable error type names for logs and CLI output
//! - Message prefixing that keeps the error kind intact

/// Main error type for the extension engine
#[derive(Debug, thiserror::Error)]
pub enum ConsumetError {
    // System-level errors
    #[error("System initialization failed: {0}")]
    InitializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Loading pipeline errors
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Factory '{factory}' not found in module {module}")]
    FactoryNotFound { module: String, factory: String },

    #[error("Syntax error: {0}")]
    SyntaxError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    // Registry errors
    #[error("Registry error: {0}")]
    RegistryError(String),

    // Cross-boundary channel errors
    #[error("Bridge error: {0}")]
    BridgeError(String),

    // I/O errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl ConsumetError {
    /// Get the error type name used in logs and CLI output
    pub fn error_type(&self) -> &'static str {
        match self {
            ConsumetError::InitializationError(_) => "InitializationError",
            ConsumetError::ConfigError(_) => "ConfigError",
            ConsumetError::NetworkError(_) => "NetworkError",
            ConsumetError::FactoryNotFound { .. } => "FactoryNotFoundError",
            ConsumetError::SyntaxError(_) => "SyntaxError",
            ConsumetError::ExecutionError(_) => "ExecutionError",
            ConsumetError::ValidationError(_) => "ValidationError",
            ConsumetError::Timeout(_) => "TimeoutError",
            ConsumetError::ModuleNotFound(_) => "ModuleNotFoundError",
            ConsumetError::RegistryError(_) => "RegistryError",
            ConsumetError::BridgeError(_) => "BridgeError",
            ConsumetError::IoError(_) => "IoError",
            ConsumetError::SerializationError(_) => "SerializationError",
            ConsumetError::DeserializationError(_) => "DeserializationError",
        }
    }

    /// Check if this error is retryable
    ///
    /// The engine itself never retries; this only informs callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsumetError::NetworkError(_) | ConsumetError::Timeout(_)
        )
    }

    /// Prefix the message with the provider or extractor in use, keeping the kind
    pub fn with_prefix(self, prefix: &str) -> Self {
        let wrap = |msg: String| format!("[{}] {}", prefix, msg);
        match self {
            ConsumetError::InitializationError(m) => ConsumetError::InitializationError(wrap(m)),
            ConsumetError::ConfigError(m) => ConsumetError::ConfigError(wrap(m)),
            ConsumetError::NetworkError(m) => ConsumetError::NetworkError(wrap(m)),
            ConsumetError::FactoryNotFound { module, factory } => ConsumetError::FactoryNotFound {
                module: wrap(module),
                factory,
            },
            ConsumetError::SyntaxError(m) => ConsumetError::SyntaxError(wrap(m)),
            ConsumetError::ExecutionError(m) => ConsumetError::ExecutionError(wrap(m)),
            ConsumetError::ValidationError(m) => ConsumetError::ValidationError(wrap(m)),
            ConsumetError::Timeout(m) => ConsumetError::Timeout(wrap(m)),
            ConsumetError::ModuleNotFound(m) => ConsumetError::ModuleNotFound(wrap(m)),
            ConsumetError::RegistryError(m) => ConsumetError::RegistryError(wrap(m)),
            ConsumetError::BridgeError(m) => ConsumetError::BridgeError(wrap(m)),
            ConsumetError::IoError(e) => {
                ConsumetError::IoError(std::io::Error::new(e.kind(), wrap(e.to_string())))
            }
            ConsumetError::SerializationError(m) => ConsumetError::SerializationError(wrap(m)),
            ConsumetError::DeserializationError(m) => ConsumetError::DeserializationError(wrap(m)),
        }
    }
}

impl From<serde_json::Error> for ConsumetError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            ConsumetError::DeserializationError(err.to_string())
        } else {
            ConsumetError::SerializationError(err.to_string())
        }
    }
}

/// Result type alias for operations that can fail with ConsumetError
pub type Result<T> = std::result::Result<T, ConsumetError>;
