//! Statically compiled providers and extractors
//!
//! Rust implementations bound through `static://<id>` mains or registered as
//! pre-bound extractors expose the same [`ExtensionInstance`] surface as
//! loaded JavaScript.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use super::instance::{ExtensionInstance, Property};
use crate::core::error::{ConsumetError, Result};

pub type StaticMethod = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub struct StaticModule {
    id: String,
    data: Map<String, Value>,
    methods: BTreeMap<String, StaticMethod>,
}

impl StaticModule {
    pub fn builder(id: impl Into<String>) -> StaticModuleBuilder {
        StaticModuleBuilder {
            module: StaticModule {
                id: id.into(),
                data: Map::new(),
                methods: BTreeMap::new(),
            },
        }
    }
}

pub struct StaticModuleBuilder {
    module: StaticModule,
}

impl StaticModuleBuilder {
    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.module.data.insert(key.into(), value.into());
        self
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let method: StaticMethod = Arc::new(move |args| Box::pin(method(args)));
        self.module.methods.insert(name.into(), method);
        self
    }

    pub fn build(self) -> StaticModule {
        self.module
    }

    pub fn shared(self) -> Arc<dyn ExtensionInstance> {
        Arc::new(self.module)
    }
}

#[async_trait]
impl ExtensionInstance for StaticModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend(&self) -> &'static str {
        "static"
    }

    fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    fn property(&self, name: &str) -> Property<'_> {
        if let Some(value) = self.data.get(name) {
            return Property::Data(value);
        }
        if self.methods.contains_key(name) {
            return Property::Method;
        }
        Property::Missing
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let Some(handler) = self.methods.get(method).cloned() else {
            return Err(ConsumetError::ExecutionError(format!(
                "{}.{} is not a function",
                self.id, method
            )));
        };
        handler(args).await
    }
}
