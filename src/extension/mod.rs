//! Extension loading and execution engine
//!
//! This module provides the pipeline that turns a registry entry into a live
//! provider or extractor:
//! - Manifest registry and alias resolution
//! - Source fetching over HTTP or from disk
//! - Capability contexts injected into loaded code
//! - Three execution backends (in-process isolate, WebView page, Node process)
//! - Method-call proxying for out-of-process instances
//! - Instance caching and the install/update/uninstall manager

pub mod alias;
pub mod backend;
pub mod cache;
pub mod context;
pub mod extractor_manager;
pub mod fetcher;
pub mod html;
pub mod http;
pub mod instance;
pub mod isolate;
pub mod manager;
pub mod models;
pub mod node_bridge;
pub mod provider;
pub mod proxy;
pub mod registry;
pub mod sandbox;
pub mod static_module;
pub mod types;
pub mod webview;

pub use alias::extract_base_extractor_name;
pub use backend::{create_backend, BackendKind, ExecuteRequest, ExecutionBackend, SharedBackend};
pub use cache::InstanceCache;
pub use context::{
    create_extractor_context, create_provider_context, ContextConfig, ExtractorContext, ExtractorResolver,
    ModuleContext, ProviderContext,
};
pub use extractor_manager::{ExtractorManager, SharedRegistry};
pub use fetcher::{FetchOptions, HttpSourceFetcher, MemorySourceFetcher, SourceFetcher};
pub use html::{HtmlParser, ScraperHtmlParser};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use instance::{ExtensionInstance, LoadedExtensionInstance, Property};
pub use manager::{ExtensionManager, InstallResult, StaticFactory, UpdateInfo};
pub use models::{EpisodeServer, MediaInfo, SearchResults, Sources};
pub use node_bridge::{NodeBackend, NodeBridge};
pub use provider::{validate_provider_instance, Extractor, Provider, ProviderMethod};
pub use proxy::{RemoteChannel, RemoteInstance};
pub use registry::{Registry, SearchFilters};
pub use sandbox::InProcessBackend;
pub use static_module::StaticModule;
pub use types::{ExtensionCategory, ExtensionManifest, ExtensionRegistry, ExtensionStatus, ExtractorInfo};
pub use webview::{IsolatePageHost, WebViewBackend, WebViewHost, WebViewPage};
