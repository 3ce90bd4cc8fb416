//! Extractor loading and caching
//!
//! Server names reported by providers come in many spellings
//! (`UpCloud`, `akcloud-hd-2`, `megacloud`). They are reduced to a canonical
//! name before the cache is consulted, so every spelling shares one instance.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::alias::extract_base_extractor_name;
use super::backend::{ExecuteRequest, SharedBackend};
use super::cache::InstanceCache;
use super::context::{create_extractor_context, ContextConfig, ExtractorResolver};
use super::fetcher::{FetchOptions, SharedSourceFetcher};
use super::instance::LoadedExtensionInstance;
use super::provider::Extractor;
use super::registry::Registry;
use super::types::STATIC_SCHEME;
use crate::core::error::{ConsumetError, Result};

/// Registry handle shared by the managers of one composition root
pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Cache key namespace for extractors, kept apart from extension ids
pub const EXTRACTOR_KEY_PREFIX: &str = "extractor:";

pub fn extractor_cache_key(name: &str) -> String {
    format!("{}{}", EXTRACTOR_KEY_PREFIX, extract_base_extractor_name(name))
}

pub struct ExtractorManager {
    registry: SharedRegistry,
    fetcher: SharedSourceFetcher,
    backend: SharedBackend,
    cache: Arc<InstanceCache>,
    context: ContextConfig,
    statics: std::sync::RwLock<HashMap<String, LoadedExtensionInstance>>,
}

impl ExtractorManager {
    pub fn new(
        registry: SharedRegistry,
        fetcher: SharedSourceFetcher,
        backend: SharedBackend,
        cache: Arc<InstanceCache>,
    ) -> Self {
        Self {
            registry,
            fetcher,
            backend,
            cache,
            context: ContextConfig::default(),
            statics: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Capabilities handed to dynamically loaded extractors
    ///
    /// Static extractors and the resolver of `config` are ignored; extractor
    /// contexts never see other extractors.
    pub fn with_context_config(mut self, config: ContextConfig) -> Self {
        self.context = ContextConfig {
            static_extractors: HashMap::new(),
            extractor_resolver: None,
            ..config
        };
        self
    }

    /// Bind a compiled-in extractor under `name`
    pub fn bind_static(&self, name: &str, instance: LoadedExtensionInstance) {
        let mut statics = self.statics.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        statics.insert(name.trim().to_lowercase(), instance);
    }

    /// Snapshot of the static bindings, for provider contexts
    pub fn static_bindings(&self) -> HashMap<String, LoadedExtensionInstance> {
        self.statics
            .read()
            .map(|statics| statics.clone())
            .unwrap_or_default()
    }

    fn static_binding(&self, name: &str) -> Option<LoadedExtensionInstance> {
        self.statics
            .read()
            .ok()
            .and_then(|statics| statics.get(&name.trim().to_lowercase()).cloned())
    }

    /// Load (or return the cached) extractor for a raw server name
    pub async fn load_extractor(&self, name: &str) -> Result<LoadedExtensionInstance> {
        let key = extractor_cache_key(name);
        if let Some(instance) = self.cache.get(&key) {
            debug!(extractor = %name, cache_key = %key, "Extractor cache hit");
            return Ok(instance);
        }
        self.cache
            .get_or_try_create(&key, || self.create(name))
            .await
    }

    pub async fn get_extractor(&self, name: &str) -> Result<Extractor> {
        let instance = self.load_extractor(name).await?;
        Ok(Extractor::new(extract_base_extractor_name(name), instance))
    }

    /// Drop the cached extractor for `name`, whatever spelling is used
    pub async fn unload_extractor(&self, name: &str) -> bool {
        self.cache.remove(&extractor_cache_key(name)).await
    }

    pub fn loaded_extractors(&self) -> Vec<String> {
        self.cache
            .keys()
            .into_iter()
            .filter_map(|key| key.strip_prefix(EXTRACTOR_KEY_PREFIX).map(str::to_string))
            .collect()
    }

    async fn create(&self, name: &str) -> Result<LoadedExtensionInstance> {
        let canonical = extract_base_extractor_name(name);
        let info = {
            let registry = self.registry.read().await;
            registry.get_extractor_info(&canonical).cloned()
        }
        .ok_or_else(|| ConsumetError::ModuleNotFound(format!("extractor '{}' is not in any registry", name)))?;

        if let Some(binding) = info.main.strip_prefix(STATIC_SCHEME) {
            return self.static_binding(binding).ok_or_else(|| {
                ConsumetError::ModuleNotFound(format!("no static extractor bound as '{}'", binding))
            });
        }

        info!(extractor = %canonical, version = %info.version, main = %info.main, "Loading extractor");
        let source = self.fetcher.fetch(&info.main, &FetchOptions::default()).await?;
        let context = create_extractor_context(Some(self.context.clone()))?;
        let instance = self
            .backend
            .execute(ExecuteRequest {
                module_id: canonical.clone(),
                source,
                factory_name: info.factory(),
                context: context.into(),
            })
            .await?;

        if !instance.has_method("extract") {
            if let Err(e) = instance.teardown().await {
                warn!(extractor = %canonical, error = %e, "Failed to tear down rejected extractor");
            }
            return Err(ConsumetError::ValidationError(format!(
                "extractor {} is missing required method 'extract'",
                canonical
            )));
        }

        info!(extractor = %canonical, backend = instance.backend(), "Extractor loaded");
        Ok(instance)
    }
}

#[async_trait]
impl ExtractorResolver for ExtractorManager {
    async fn resolve(&self, name: &str) -> Result<LoadedExtensionInstance> {
        self.load_extractor(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::backend::{BackendKind, ExecutionBackend};
    use crate::extension::fetcher::MemorySourceFetcher;
    use crate::extension::static_module::StaticModule;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Builds static modules instead of evaluating source
    struct FakeBackend {
        executions: AtomicUsize,
        sources: std::sync::Mutex<Vec<String>>,
        methods: Vec<&'static str>,
    }

    impl FakeBackend {
        fn with_methods(methods: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                executions: AtomicUsize::new(0),
                sources: std::sync::Mutex::new(Vec::new()),
                methods,
            })
        }
    }

    #[async_trait]
    impl ExecutionBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::InProcess
        }

        async fn execute(&self, request: ExecuteRequest) -> Result<LoadedExtensionInstance> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.sources.lock().unwrap().push(request.source.clone());
            let mut builder = StaticModule::builder(request.module_id);
            for method in &self.methods {
                builder = builder.method(*method, |args| async move {
                    Ok(json!({"sources": [{"url": args[0], "isM3U8": true}]}))
                });
            }
            Ok(builder.shared())
        }
    }

    fn registry() -> SharedRegistry {
        let mut registry = Registry::new();
        registry
            .load_registry_from_str(
                r#"{
                    "metadata": {"name": "official", "version": "1.0.0"},
                    "extensions": [],
                    "extractors": [
                        {"name": "MegaCloud", "version": "1.2.0", "main": "https://cdn.example/megacloud.js"},
                        {"name": "StreamSB", "version": "1.0.0", "main": "static://streamsb"}
                    ]
                }"#,
            )
            .unwrap();
        Arc::new(RwLock::new(registry))
    }

    fn manager(backend: Arc<FakeBackend>) -> (ExtractorManager, Arc<MemorySourceFetcher>) {
        let fetcher = Arc::new(MemorySourceFetcher::new());
        fetcher.insert("https://cdn.example/megacloud.js", "function createMegaCloud() {}");
        let manager = ExtractorManager::new(registry(), fetcher.clone(), backend, Arc::new(InstanceCache::new()));
        (manager, fetcher)
    }

    #[tokio::test]
    async fn test_aliases_share_one_instance() {
        let backend = FakeBackend::with_methods(vec!["extract"]);
        let (manager, fetcher) = manager(backend.clone());

        let first = manager.load_extractor("upcloud").await.unwrap();
        let second = manager.load_extractor("akcloud-hd-2").await.unwrap();
        let third = manager.load_extractor("MegaCloud").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(fetcher.fetch_count(), 1);
        assert_eq!(backend.executions.load(Ordering::SeqCst), 1);
        assert_eq!(manager.loaded_extractors(), vec!["megacloud".to_string()]);
    }

    #[tokio::test]
    async fn test_extractor_without_extract_is_rejected() {
        let backend = FakeBackend::with_methods(vec!["decrypt"]);
        let (manager, _) = manager(backend.clone());

        let err = manager.load_extractor("megacloud").await.err().unwrap();
        assert!(matches!(err, ConsumetError::ValidationError(ref m) if m.contains("'extract'")));
        assert!(manager.loaded_extractors().is_empty());

        // Failures are not cached
        let _ = manager.load_extractor("megacloud").await;
        assert_eq!(backend.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_extractor_does_no_network() {
        let (manager, fetcher) = manager(FakeBackend::with_methods(vec!["extract"]));
        let err = manager.load_extractor("doodstream").await.err().unwrap();
        assert!(matches!(err, ConsumetError::ModuleNotFound(_)));
        assert_eq!(fetcher.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_static_main_uses_bound_extractor() {
        let backend = FakeBackend::with_methods(vec!["extract"]);
        let (manager, fetcher) = manager(backend.clone());
        manager.bind_static(
            "StreamSB",
            StaticModule::builder("streamsb")
                .method("extract", |_| async { Ok(json!({"sources": []})) })
                .shared(),
        );

        let extractor = manager.get_extractor("streamsb").await.unwrap();
        assert_eq!(extractor.instance().backend(), "static");
        assert_eq!(fetcher.fetch_count(), 0);
        assert_eq!(backend.executions.load(Ordering::SeqCst), 0);
        assert!(manager.static_bindings().contains_key("streamsb"));
    }

    #[tokio::test]
    async fn test_alias_entry_never_shadows_canonical_manifest() {
        let upcloud = r#"{"name": "UpCloud", "version": "0.9.0", "main": "https://cdn.example/upcloud.js"}"#;
        let megacloud = r#"{"name": "MegaCloud", "version": "1.2.0", "main": "https://cdn.example/megacloud.js"}"#;

        for entries in [[upcloud, megacloud], [megacloud, upcloud]] {
            for requests in [["upcloud", "megacloud"], ["megacloud", "upcloud"]] {
                let mut registry = Registry::new();
                registry
                    .load_registry_from_str(&format!(
                        r#"{{"metadata": {{"name": "official", "version": "1.0.0"}}, "extensions": [], "extractors": [{}]}}"#,
                        entries.join(",")
                    ))
                    .unwrap();

                let fetcher = Arc::new(MemorySourceFetcher::new());
                fetcher.insert("https://cdn.example/upcloud.js", "function createUpCloud() {}");
                fetcher.insert("https://cdn.example/megacloud.js", "function createMegaCloud() {}");
                let backend = FakeBackend::with_methods(vec!["extract"]);
                let manager = ExtractorManager::new(
                    Arc::new(RwLock::new(registry)),
                    fetcher,
                    backend.clone(),
                    Arc::new(InstanceCache::new()),
                );

                let first = manager.load_extractor(requests[0]).await.unwrap();
                let second = manager.load_extractor(requests[1]).await.unwrap();
                assert!(Arc::ptr_eq(&first, &second));
                assert_eq!(
                    *backend.sources.lock().unwrap(),
                    vec!["function createMegaCloud() {}".to_string()],
                    "entries {:?}, requests {:?}",
                    entries,
                    requests
                );
            }
        }
    }

    #[tokio::test]
    async fn test_unload_accepts_any_spelling() {
        let (manager, _) = manager(FakeBackend::with_methods(vec!["extract"]));
        let extractor = manager.get_extractor("UpCloud").await.unwrap();
        let sources = extractor.extract("https://megacloud/e/1", Vec::new()).await.unwrap();
        assert_eq!(sources.sources[0].url, "https://megacloud/e/1");

        assert!(manager.unload_extractor("megacloud-backup").await);
        assert!(manager.loaded_extractors().is_empty());
    }
}
