//! Consumet extension engine
//!
//! This library loads provider and extractor modules described by registry
//! manifests, runs them in a sandboxed JavaScript backend with an injected
//! capability context, and exposes them through typed Rust handles.

pub mod core;
pub mod extension;

// Re-export commonly used types
pub use crate::core::{Config, ConsumetError};
pub use extension::{ExtensionManager, Provider, Registry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for the library
pub type Result<T> = crate::core::error::Result<T>;
