//! The uniform interface over loaded provider and extractor instances

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::core::error::Result;

/// Result of reading a property off an instance
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Property<'a> {
    /// A plain data field, available without a call
    Data(&'a Value),
    /// Reserved name answered by the underlying plain object, never a remote call
    Passthrough(Option<&'a Value>),
    /// Callable method
    Method,
    /// Nothing by that name (same-process instances only)
    Missing,
}

/// A live provider or extractor
///
/// Same-process instances (static bindings, the in-process sandbox) and
/// proxy-backed ones (WebView pages, the Node process) look identical here.
#[async_trait]
pub trait ExtensionInstance: Send + Sync {
    /// Module id the instance was loaded as
    fn id(&self) -> &str;

    /// Label of the backend that produced it
    fn backend(&self) -> &'static str;

    /// Snapshot of the instance's non-function fields
    fn data(&self) -> &Map<String, Value>;

    /// Methods known to exist on the instance
    fn method_names(&self) -> Vec<String>;

    fn has_method(&self, name: &str) -> bool {
        self.method_names().iter().any(|m| m == name)
    }

    fn property(&self, name: &str) -> Property<'_>;

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    /// Release the execution context behind the instance
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

pub type LoadedExtensionInstance = Arc<dyn ExtensionInstance>;

/// `name` field of the data snapshot, if the instance has one
pub fn display_name(instance: &dyn ExtensionInstance) -> String {
    match instance.property("name") {
        Property::Data(Value::String(name)) => name.clone(),
        _ => instance.id().to_string(),
    }
}
