//! Method-call proxy layer
//!
//! A [`RemoteInstance`] stands in for an object living in another execution
//! context. Its data fields were snapshotted when it was instantiated and are
//! read locally; every other name is forwarded over a [`RemoteChannel`] and
//! answered with a `{success, result}` / `{success: false, error}` envelope.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::instance::{ExtensionInstance, Property};
use crate::core::error::{ConsumetError, Result};

/// Transport for calls into a remote execution context
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Invoke `method` remotely and return the raw reply envelope
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    /// Tear down the remote context, if it is not shared
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Names that must never be treated as remote methods
///
/// `then` in particular keeps awaiting code from mistaking the proxy for a
/// promise.
pub fn is_reserved_property(name: &str) -> bool {
    matches!(
        name,
        "then" | "catch" | "finally" | "constructor" | "toString" | "valueOf"
    ) || name.starts_with('_')
        || name.starts_with("@@")
}

/// Decode a reply envelope into the method's result
pub fn decode_envelope(envelope: Value, module_id: &str) -> Result<Value> {
    let mut reply = match envelope {
        Value::Object(reply) => reply,
        other => {
            return Err(ConsumetError::BridgeError(format!(
                "malformed reply envelope: {}",
                other
            )))
        }
    };

    match reply.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(reply.remove("result").unwrap_or(Value::Null)),
        Some(false) => {
            let error = reply.get("error");
            let kind = error
                .and_then(|e| e.get("kind"))
                .and_then(Value::as_str)
                .unwrap_or("execution");
            Err(script_error(kind, error_message(error), module_id, ""))
        }
        None => Err(ConsumetError::BridgeError(format!(
            "reply envelope without success flag: {}",
            Value::Object(reply)
        ))),
    }
}

/// Map a failure reported by a JavaScript context onto the error kinds
///
/// `kind` is one of `syntax`, `factory`, `module`, `timeout` or `execution`.
pub fn script_error(kind: &str, message: String, module_id: &str, factory: &str) -> ConsumetError {
    match kind {
        "syntax" => ConsumetError::SyntaxError(message),
        "factory" => ConsumetError::FactoryNotFound {
            module: module_id.to_string(),
            factory: factory.to_string(),
        },
        "module" => ConsumetError::ModuleNotFound(message),
        "timeout" => ConsumetError::Timeout(message),
        _ => ConsumetError::ExecutionError(message),
    }
}

fn error_message(error: Option<&Value>) -> String {
    match error {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(other) => other.to_string(),
        None => "unknown remote error".to_string(),
    }
}

pub struct RemoteInstance {
    id: String,
    backend: &'static str,
    data: Map<String, Value>,
    methods: Vec<String>,
    channel: Arc<dyn RemoteChannel>,
}

impl RemoteInstance {
    pub fn new(
        id: impl Into<String>,
        backend: &'static str,
        data: Map<String, Value>,
        methods: Vec<String>,
        channel: Arc<dyn RemoteChannel>,
    ) -> Self {
        Self {
            id: id.into(),
            backend,
            data,
            methods,
            channel,
        }
    }

    /// Build from a `{data, methods}` description reported by the remote side
    pub fn from_description(
        id: impl Into<String>,
        backend: &'static str,
        description: &Value,
        channel: Arc<dyn RemoteChannel>,
    ) -> Self {
        let data = description
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let methods = description
            .get("methods")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self::new(id, backend, data, methods, channel)
    }
}

#[async_trait]
impl ExtensionInstance for RemoteInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend(&self) -> &'static str {
        self.backend
    }

    fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    fn method_names(&self) -> Vec<String> {
        self.methods.clone()
    }

    fn property(&self, name: &str) -> Property<'_> {
        if is_reserved_property(name) {
            return Property::Passthrough(self.data.get(name));
        }
        match self.data.get(name) {
            Some(value) => Property::Data(value),
            None => Property::Method,
        }
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match self.property(method) {
            Property::Method => {}
            _ => {
                return Err(ConsumetError::ExecutionError(format!(
                    "{}.{} is not a function",
                    self.id, method
                )))
            }
        }

        tracing::debug!(module_id = %self.id, backend = self.backend, method = %method, "Forwarding remote call");
        let envelope = self.channel.invoke(method, args).await?;
        decode_envelope(envelope, &self.id)
    }

    async fn teardown(&self) -> Result<()> {
        self.channel.close().await
    }
}
