//! Execution backends
//!
//! A backend turns module source plus a context into a live instance. The
//! in-process sandbox, a WebView page and the external Node process are
//! interchangeable behind [`ExecutionBackend`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::context::ModuleContext;
use super::instance::LoadedExtensionInstance;
use super::node_bridge::NodeBackend;
use super::sandbox::InProcessBackend;
use super::webview::{IsolatePageHost, WebViewBackend};
use crate::core::config::EngineConfig;
use crate::core::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "in_process")]
    InProcess,
    #[serde(rename = "webview")]
    WebView,
    #[serde(rename = "node")]
    Node,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::InProcess => "in_process",
            BackendKind::WebView => "webview",
            BackendKind::Node => "node",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "in_process" | "in-process" | "inprocess" | "sandbox" => Ok(BackendKind::InProcess),
            "webview" | "web_view" => Ok(BackendKind::WebView),
            "node" | "nodejs" => Ok(BackendKind::Node),
            other => Err(format!(
                "unknown backend '{}' (expected in_process, webview or node)",
                other
            )),
        }
    }
}

/// Everything a backend needs to produce one instance
#[derive(Clone)]
pub struct ExecuteRequest {
    pub module_id: String,
    pub source: String,
    pub factory_name: String,
    pub context: ModuleContext,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Evaluate `request.source`, call its factory with the context and
    /// return the resulting instance
    async fn execute(&self, request: ExecuteRequest) -> Result<LoadedExtensionInstance>;

    /// Release backend-wide resources
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub type SharedBackend = Arc<dyn ExecutionBackend>;

/// Backend selected by `engine.backend`
pub fn create_backend(config: &EngineConfig) -> Result<SharedBackend> {
    let kind = config.backend_kind()?;
    tracing::info!(backend = %kind, "Selecting execution backend");

    let backend: SharedBackend = match kind {
        BackendKind::InProcess => Arc::new(InProcessBackend::new(config)),
        BackendKind::WebView => Arc::new(WebViewBackend::new(Arc::new(IsolatePageHost::new()), config)),
        BackendKind::Node => Arc::new(NodeBackend::new(config)),
    };
    Ok(backend)
}
