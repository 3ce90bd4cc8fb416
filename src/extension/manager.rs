//! Extension manager
//!
//! Composition root of the loading pipeline. It owns the installed set and
//! the instance cache, and turns an extension id into a live provider:
//! manifest lookup, source fetch, execution with an injected context,
//! contract validation, then caching.
//!
//! Cache keys are `<extension id>:<factory>`; extractors live under
//! [`EXTRACTOR_KEY_PREFIX`](super::extractor_manager::EXTRACTOR_KEY_PREFIX).

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::backend::{create_backend, ExecuteRequest, SharedBackend};
use super::cache::InstanceCache;
use super::context::{create_provider_context, ContextConfig, ExtractorResolver, ProviderContext};
use super::extractor_manager::{ExtractorManager, SharedRegistry};
use super::fetcher::{FetchOptions, HttpSourceFetcher, SharedSourceFetcher, DEFAULT_FETCH_TIMEOUT};
use super::http::ReqwestClient;
use super::instance::LoadedExtensionInstance;
use super::provider::{validate_provider_instance, Provider};
use super::registry::{Registry, SearchFilters};
use super::types::{ExtensionCategory, ExtensionManifest, ExtensionStatus};
use crate::core::config::Config;
use crate::core::error::{ConsumetError, Result};

/// Builds a compiled-in provider from its context
pub type StaticFactory = Arc<dyn Fn(&ProviderContext) -> Result<LoadedExtensionInstance> + Send + Sync>;

const STATE_VERSION: u32 = 1;

/// Outcome of an install; failures are reported here, never raised
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<ExtensionManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl InstallResult {
    fn failed(error: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            extension: None,
            error: Some(error.into()),
            warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// Manifest of the available version
    pub extension: ExtensionManifest,
    pub current_version: String,
    pub available_version: String,
}

/// On-disk form of the installed set
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstalledState {
    version: u32,
    updated_at: String,
    installed: Vec<ExtensionManifest>,
}

/// Whether `available` should be offered over `current`
///
/// Semver versions must be strictly newer; anything unparseable falls back
/// to plain inequality.
pub fn is_update(current: &str, available: &str) -> bool {
    match (Version::parse(current), Version::parse(available)) {
        (Ok(current), Ok(available)) => available > current,
        _ => current != available,
    }
}

fn install_warnings(manifest: &ExtensionManifest) -> Vec<String> {
    let mut warnings = Vec::new();
    match manifest.status {
        ExtensionStatus::Beta => warnings.push(format!("{} is in beta and may be unstable", manifest.name)),
        ExtensionStatus::Broken => warnings.push(format!("{} is marked as broken", manifest.name)),
        ExtensionStatus::Stable => {}
    }
    if manifest.nsfw {
        warnings.push(format!("{} serves NSFW content", manifest.name));
    }
    if Version::parse(&manifest.version).is_err() {
        warnings.push(format!(
            "version '{}' is not semver; update checks fall back to string comparison",
            manifest.version
        ));
    }
    if manifest.factories.is_empty() {
        warnings.push(format!("{} declares no factory; one must be named when creating it", manifest.name));
    }
    warnings
}

fn cache_key(id: &str, factory: &str) -> String {
    format!("{}:{}", id, factory)
}

fn id_prefix(id: &str) -> String {
    format!("{}:", id)
}

pub struct ExtensionManager {
    registry: SharedRegistry,
    fetcher: SharedSourceFetcher,
    backend: SharedBackend,
    cache: Arc<InstanceCache>,
    extractors: Arc<ExtractorManager>,
    installed: RwLock<HashMap<String, ExtensionManifest>>,
    static_factories: std::sync::RwLock<HashMap<String, StaticFactory>>,
    context: ContextConfig,
    state_file: Option<PathBuf>,
    probe_timeout: Duration,
}

impl ExtensionManager {
    /// Manager over explicit collaborators
    ///
    /// `context` supplies the capabilities injected into every loaded module.
    pub fn new(
        registry: SharedRegistry,
        fetcher: SharedSourceFetcher,
        backend: SharedBackend,
        context: ContextConfig,
    ) -> Self {
        let cache = Arc::new(InstanceCache::new());
        let extractors = ExtractorManager::new(registry.clone(), fetcher.clone(), backend.clone(), cache.clone())
            .with_context_config(context.clone());
        for (name, instance) in &context.static_extractors {
            extractors.bind_static(name, instance.clone());
        }

        Self {
            registry,
            fetcher,
            backend,
            cache,
            extractors: Arc::new(extractors),
            installed: RwLock::new(HashMap::new()),
            static_factories: std::sync::RwLock::new(HashMap::new()),
            context,
            state_file: None,
            probe_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Persist the installed set to `path`
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Wire everything from configuration, load the configured registries
    /// and restore the installed set
    pub async fn from_config(config: &Config) -> Result<Self> {
        let http = ReqwestClient::shared(&config.http)?;
        let fetcher: SharedSourceFetcher = Arc::new(HttpSourceFetcher::new(http.clone()));
        let backend = create_backend(&config.engine)?;
        let context = ContextConfig {
            http_client: Some(http),
            user_agent: Some(config.http.user_agent.clone()),
            ..Default::default()
        };

        let mut manager = Self::new(Arc::new(RwLock::new(Registry::new())), fetcher, backend, context);
        manager.state_file = config.storage.state_path();

        for source in &config.registry.sources {
            if let Err(e) = manager.add_registry_source(source).await {
                warn!(source = %source, error = %e, "Skipping registry source");
            }
        }

        let restored = manager.restore_state().await?;
        info!(
            backend = manager.backend.kind().as_str(),
            registries = manager.registry.read().await.registries().len(),
            restored,
            "Extension manager ready"
        );
        Ok(manager)
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn extractors(&self) -> &Arc<ExtractorManager> {
        &self.extractors
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Fetch a registry document (URL or local path) and add it to the union
    pub async fn add_registry_source(&self, source: &str) -> Result<()> {
        let document = self.fetcher.fetch(source, &FetchOptions::default()).await?;
        self.registry.write().await.load_registry_from_str(&document)
    }

    pub async fn search_extensions(&self, filters: &SearchFilters) -> Vec<ExtensionManifest> {
        self.registry
            .read()
            .await
            .search_extensions(filters)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Bind a compiled-in provider to `static://<id>` mains
    pub fn bind_static(&self, id: &str, factory: StaticFactory) {
        let mut factories = self
            .static_factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        factories.insert(id.to_string(), factory);
    }

    pub fn bind_static_extractor(&self, name: &str, instance: LoadedExtensionInstance) {
        self.extractors.bind_static(name, instance);
    }

    fn static_factory(&self, id: &str) -> Option<StaticFactory> {
        self.static_factories
            .read()
            .ok()
            .and_then(|factories| factories.get(id).cloned())
    }

    /// Install the newest manifest of `id` in the registry union
    ///
    /// Resolves the same way as [`ExtensionManager::check_for_updates`], so a
    /// fresh install never reports itself as outdated.
    pub async fn install_extension(&self, id: &str) -> InstallResult {
        let manifest = self.registry.read().await.latest_manifest(id).cloned();
        let Some(manifest) = manifest else {
            return InstallResult::failed(format!("Extension {} not found in any registry", id), Vec::new());
        };

        let mut warnings = install_warnings(&manifest);

        match manifest.static_binding() {
            Some(binding) => {
                if self.static_factory(binding).is_none() {
                    warnings.push(format!("no static implementation is bound as '{}' yet", binding));
                }
            }
            None => {
                if let Err(e) = self.fetcher.probe(&manifest.main, self.probe_timeout).await {
                    warn!(extension = %id, main = %manifest.main, error = %e, "Install probe failed");
                    return InstallResult::failed(
                        format!("{} is not reachable: {}", manifest.main, e),
                        warnings,
                    );
                }
            }
        }

        let previous = self
            .installed
            .write()
            .await
            .insert(id.to_string(), manifest.clone());
        if let Some(previous) = previous {
            if previous.version != manifest.version || previous.main != manifest.main {
                let purged = self.cache.remove_prefixed(&id_prefix(id)).await;
                debug!(extension = %id, purged, "Dropped instances of the replaced version");
            }
        }

        if let Err(e) = self.persist_state().await {
            warnings.push(format!("installed set was not saved: {}", e));
        }

        info!(extension = %id, version = %manifest.version, warnings = warnings.len(), "Extension installed");
        InstallResult {
            success: true,
            extension: Some(manifest),
            error: None,
            warnings,
        }
    }

    /// Remove `id` from the installed set and drop its cached instances
    pub async fn uninstall_extension(&self, id: &str) -> bool {
        let removed = self.installed.write().await.remove(id).is_some();
        let purged = self.cache.remove_prefixed(&id_prefix(id)).await;

        if removed {
            if let Err(e) = self.persist_state().await {
                warn!(extension = %id, error = %e, "Failed to save installed set");
            }
            info!(extension = %id, purged, "Extension uninstalled");
        }
        removed
    }

    pub async fn is_installed(&self, id: &str) -> bool {
        self.installed.read().await.contains_key(id)
    }

    pub async fn list_installed(&self) -> Vec<ExtensionManifest> {
        let mut installed: Vec<ExtensionManifest> = self.installed.read().await.values().cloned().collect();
        installed.sort_by(|a, b| a.id.cmp(&b.id));
        installed
    }

    /// Installed extensions with a newer manifest in the registry union
    pub async fn check_for_updates(&self) -> Vec<UpdateInfo> {
        let installed = self.list_installed().await;
        let registry = self.registry.read().await;

        installed
            .into_iter()
            .filter_map(|current| {
                let latest = registry.latest_manifest(&current.id)?;
                is_update(&current.version, &latest.version).then(|| UpdateInfo {
                    extension: latest.clone(),
                    current_version: current.version.clone(),
                    available_version: latest.version.clone(),
                })
            })
            .collect()
    }

    async fn installed_manifest(&self, id: &str) -> Result<ExtensionManifest> {
        self.installed
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ConsumetError::ModuleNotFound(format!("extension {} is not installed", id)))
    }

    /// Load an installed extension with its default factory
    pub async fn load_extension(&self, id: &str) -> Result<LoadedExtensionInstance> {
        let manifest = self.installed_manifest(id).await?;
        let factory = manifest.factory_name().map(str::to_string).ok_or_else(|| {
            ConsumetError::ValidationError(format!("extension {} declares no factory", id))
        })?;
        self.load(&manifest, &factory).await
    }

    /// Load an installed extension through `factory` and wrap it as a provider
    pub async fn create_provider(&self, id: &str, factory: &str) -> Result<Provider> {
        let manifest = self.installed_manifest(id).await?;
        if !manifest.factories.is_empty() && !manifest.has_factory(factory) {
            debug!(extension = %id, factory = %factory, "Factory not listed in manifest");
        }
        let instance = self.load(&manifest, factory).await?;
        Ok(Provider::new(manifest.category, instance))
    }

    /// Provider for an installed extension through its default factory
    pub async fn provider(&self, id: &str) -> Result<Provider> {
        let manifest = self.installed_manifest(id).await?;
        let instance = self.load_extension(id).await?;
        Ok(Provider::new(manifest.category, instance))
    }

    /// Drop cached instances of `id`; it stays installed
    pub async fn unload_extension(&self, id: &str) -> usize {
        let purged = self.cache.remove_prefixed(&id_prefix(id)).await;
        info!(extension = %id, purged, "Extension unloaded");
        purged
    }

    /// Check an instance against the contract of `category`
    pub fn validate_provider_instance(
        &self,
        instance: &LoadedExtensionInstance,
        category: ExtensionCategory,
    ) -> Result<()> {
        validate_provider_instance(instance, category)
    }

    async fn load(&self, manifest: &ExtensionManifest, factory: &str) -> Result<LoadedExtensionInstance> {
        let key = cache_key(&manifest.id, factory);
        if let Some(instance) = self.cache.get(&key) {
            debug!(extension = %manifest.id, cache_key = %key, "Instance cache hit");
            return Ok(instance);
        }

        self.cache
            .get_or_try_create(&key, || async {
                let instance = self.instantiate(manifest, factory).await?;
                if let Err(e) = validate_provider_instance(&instance, manifest.category) {
                    if let Err(teardown) = instance.teardown().await {
                        warn!(extension = %manifest.id, error = %teardown, "Failed to tear down rejected instance");
                    }
                    return Err(e);
                }
                info!(
                    extension = %manifest.id,
                    version = %manifest.version,
                    backend = instance.backend(),
                    "Extension loaded"
                );
                Ok(instance)
            })
            .await
            .map_err(|e| e.with_prefix(&manifest.id))
    }

    fn provider_context(&self) -> Result<ProviderContext> {
        let mut statics = self.context.static_extractors.clone();
        statics.extend(self.extractors.static_bindings());
        let resolver: Arc<dyn ExtractorResolver> = self.extractors.clone();

        create_provider_context(Some(ContextConfig {
            static_extractors: statics,
            extractor_resolver: Some(resolver),
            ..self.context.clone()
        }))
    }

    async fn instantiate(&self, manifest: &ExtensionManifest, factory: &str) -> Result<LoadedExtensionInstance> {
        let context = self.provider_context()?;

        if let Some(binding) = manifest.static_binding() {
            let build = self.static_factory(binding).ok_or_else(|| {
                ConsumetError::ModuleNotFound(format!("no static implementation bound as '{}'", binding))
            })?;
            return build(&context);
        }

        info!(extension = %manifest.id, main = %manifest.main, "Fetching extension source");
        let source = self.fetcher.fetch(&manifest.main, &FetchOptions::default()).await?;
        self.backend
            .execute(ExecuteRequest {
                module_id: manifest.id.clone(),
                source,
                factory_name: factory.to_string(),
                context: context.into(),
            })
            .await
    }

    /// Read the installed set from the state file, if there is one
    pub async fn restore_state(&self) -> Result<usize> {
        let Some(path) = &self.state_file else {
            return Ok(0);
        };
        if !tokio::fs::try_exists(path).await? {
            return Ok(0);
        }

        let raw = tokio::fs::read_to_string(path).await?;
        let state: InstalledState = serde_json::from_str(&raw).map_err(|e| {
            ConsumetError::DeserializationError(format!("invalid state file {}: {}", path.display(), e))
        })?;

        let mut installed = self.installed.write().await;
        let count = state.installed.len();
        for manifest in state.installed {
            installed.insert(manifest.id.clone(), manifest);
        }
        debug!(path = %path.display(), count, "Restored installed set");
        Ok(count)
    }

    async fn persist_state(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let state = InstalledState {
            version: STATE_VERSION,
            updated_at: chrono::Utc::now().to_rfc3339(),
            installed: self.list_installed().await,
        };
        write_state(path, &state).await
    }

    /// Tear down every cached instance and stop the backend
    pub async fn shutdown(&self) -> Result<()> {
        let released = self.cache.remove_prefixed("").await;
        debug!(released, "Released cached instances");
        self.backend.shutdown().await
    }
}

async fn write_state(path: &Path, state: &InstalledState) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::extension::backend::{BackendKind, ExecutionBackend};
    use crate::extension::fetcher::MemorySourceFetcher;
    use crate::extension::sandbox::InProcessBackend;
    use crate::extension::static_module::StaticModule;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ZORO_SOURCE: &str = r#"
        function createZoro(ctx) {
            return {
                name: 'Zoro',
                baseUrl: 'https://zoro.example',
                async search(query, page) {
                    return { currentPage: page || 1, hasNextPage: false, results: [{ id: query + '-1', title: query }] };
                },
                async fetchAnimeInfo(id) { return { id, title: id, episodes: [] }; },
                async fetchEpisodeServers(episodeId) { return [{ name: 'UpCloud', url: 'https://upcloud.example/e/' + episodeId }]; },
                async fetchEpisodeSources(episodeId) {
                    return ctx.extractors.UpCloud.extract('https://upcloud.example/e/' + episodeId);
                },
            };
        }
    "#;

    const INCOMPLETE_SOURCE: &str = r#"
        function createHalf(ctx) {
            return { name: 'Half', async search() { return { results: [] }; }, async fetchAnimeInfo() { return {}; } };
        }
    "#;

    struct CountingBackend {
        inner: InProcessBackend,
        executions: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionBackend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::InProcess
        }

        async fn execute(&self, request: ExecuteRequest) -> Result<LoadedExtensionInstance> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.inner.execute(request).await
        }
    }

    fn registry_doc(version: &str, extensions: &str) -> String {
        format!(
            r#"{{"metadata": {{"name": "registry-{}", "version": "{}"}}, "extensions": [{}]}}"#,
            version, version, extensions
        )
    }

    fn manifest(id: &str, version: &str, main: &str, factory: &str) -> String {
        format!(
            r#"{{"id": "{}", "name": "{}", "version": "{}", "category": "anime", "main": "{}", "factories": ["{}"]}}"#,
            id, id, version, main, factory
        )
    }

    struct Fixture {
        manager: ExtensionManager,
        fetcher: Arc<MemorySourceFetcher>,
        backend: Arc<CountingBackend>,
    }

    fn fixture(documents: &[String]) -> Fixture {
        let mut registry = Registry::new();
        for doc in documents {
            registry.load_registry_from_str(doc).unwrap();
        }

        let fetcher = Arc::new(MemorySourceFetcher::new());
        fetcher.insert("https://cdn.example/zoro.js", ZORO_SOURCE);
        fetcher.insert("https://cdn.example/half.js", INCOMPLETE_SOURCE);

        let backend = Arc::new(CountingBackend {
            inner: InProcessBackend::new(&EngineConfig::default()),
            executions: AtomicUsize::new(0),
        });

        let upcloud = StaticModule::builder("megacloud")
            .method("extract", |args| async move {
                Ok(json!({"sources": [{"url": args[0], "isM3U8": true}], "subtitles": []}))
            })
            .shared();
        let context = ContextConfig {
            static_extractors: HashMap::from([("megacloud".to_string(), upcloud)]),
            ..Default::default()
        };

        let manager = ExtensionManager::new(
            Arc::new(RwLock::new(registry)),
            fetcher.clone(),
            backend.clone(),
            context,
        );
        Fixture {
            manager,
            fetcher,
            backend,
        }
    }

    fn zoro_registry() -> String {
        registry_doc(
            "1.0.0",
            &[
                manifest("zoro-anime", "1.0.0", "https://cdn.example/zoro.js", "createZoro"),
                manifest("half-anime", "1.0.0", "https://cdn.example/half.js", "createHalf"),
                manifest("gone-anime", "1.0.0", "https://cdn.example/missing.js", "createGone"),
            ]
            .join(","),
        )
    }

    #[tokio::test]
    async fn test_install_create_and_search() {
        let fx = fixture(&[zoro_registry()]);

        let result = fx.manager.install_extension("zoro-anime").await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.warnings.is_empty());
        assert!(fx.manager.is_installed("zoro-anime").await);

        let provider = fx.manager.create_provider("zoro-anime", "createZoro").await.unwrap();
        assert!(provider.instance().has_method("search"));
        let results = provider.search("naruto", None).await.unwrap();
        assert_eq!(results.current_page, 1);
        assert!(!results.has_next_page);
        assert_eq!(results.results[0].id, "naruto-1");
    }

    #[tokio::test]
    async fn test_loading_twice_fetches_and_executes_once() {
        let fx = fixture(&[zoro_registry()]);
        assert!(fx.manager.install_extension("zoro-anime").await.success);

        let first = fx.manager.load_extension("zoro-anime").await.unwrap();
        let second = fx.manager.load_extension("zoro-anime").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.fetcher.fetch_count(), 1);
        assert_eq!(fx.backend.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_reaches_static_extractor_through_alias() {
        let fx = fixture(&[zoro_registry()]);
        assert!(fx.manager.install_extension("zoro-anime").await.success);

        // No registry lists UpCloud: the resolver fails and the canonical static binding answers
        let provider = fx.manager.create_provider("zoro-anime", "createZoro").await.unwrap();
        let sources = provider.fetch_episode_sources("ep-7", None).await.unwrap();
        assert_eq!(sources.sources[0].url, "https://upcloud.example/e/ep-7");
        assert!(sources.sources[0].is_m3u8);
    }

    #[tokio::test]
    async fn test_install_failures_are_reported() {
        let fx = fixture(&[zoro_registry()]);

        let unknown = fx.manager.install_extension("nope").await;
        assert!(!unknown.success);
        assert!(unknown.error.unwrap().contains("not found"));

        let unreachable = fx.manager.install_extension("gone-anime").await;
        assert!(!unreachable.success);
        assert!(unreachable.error.unwrap().contains("https://cdn.example/missing.js"));
        assert!(!fx.manager.is_installed("gone-anime").await);
    }

    #[tokio::test]
    async fn test_install_warnings() {
        let doc = registry_doc(
            "1.0.0",
            r#"{"id": "risky", "name": "Risky", "version": "nightly", "category": "anime",
                "main": "https://cdn.example/zoro.js", "factories": ["createZoro"], "status": "beta", "nsfw": true}"#,
        );
        let fx = fixture(&[doc]);

        let result = fx.manager.install_extension("risky").await;
        assert!(result.success);
        assert_eq!(result.warnings.len(), 3);
        assert!(result.warnings.iter().any(|w| w.contains("beta")));
        assert!(result.warnings.iter().any(|w| w.contains("NSFW")));
        assert!(result.warnings.iter().any(|w| w.contains("nightly")));
    }

    #[tokio::test]
    async fn test_incomplete_provider_fails_validation() {
        let fx = fixture(&[zoro_registry()]);
        assert!(fx.manager.install_extension("half-anime").await.success);

        let err = fx.manager.load_extension("half-anime").await.err().unwrap();
        match err {
            ConsumetError::ValidationError(message) => assert!(message.contains("fetchEpisodeSources"), "{}", message),
            other => panic!("expected validation error, got {}", other),
        }
        assert!(fx.manager.cache.is_empty());
    }

    #[tokio::test]
    async fn test_update_detection() {
        let installed = registry_doc("1.0.0", &manifest("zoro-anime", "1.0.0", "https://cdn.example/zoro.js", "createZoro"));
        let fx = fixture(&[installed]);
        assert!(fx.manager.install_extension("zoro-anime").await.success);
        assert!(fx.manager.check_for_updates().await.is_empty());

        let newer = registry_doc("1.0.1", &manifest("zoro-anime", "1.0.1", "https://cdn.example/zoro.js", "createZoro"));
        fx.manager.registry().write().await.load_registry_from_str(&newer).unwrap();

        let updates = fx.manager.check_for_updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].current_version, "1.0.0");
        assert_eq!(updates[0].available_version, "1.0.1");
    }

    #[tokio::test]
    async fn test_install_takes_newest_manifest_across_registries() {
        // The older document loads last, so id lookups alone would pick 1.9.0
        let newer = registry_doc("1.10.0", &manifest("zoro-anime", "1.10.0", "https://cdn.example/zoro.js", "createZoro"));
        let older = registry_doc("1.9.0", &manifest("zoro-anime", "1.9.0", "https://cdn.example/zoro.js", "createZoro"));
        let fx = fixture(&[newer, older]);

        let result = fx.manager.install_extension("zoro-anime").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.extension.unwrap().version, "1.10.0");
        assert!(fx.manager.check_for_updates().await.is_empty());

        assert!(fx.manager.install_extension("zoro-anime").await.success);
        assert_eq!(fx.manager.list_installed().await[0].version, "1.10.0");
    }

    #[test]
    fn test_update_comparison() {
        assert!(is_update("1.0.0", "1.0.1"));
        assert!(!is_update("1.2.0", "1.1.0"));
        assert!(!is_update("1.0.0", "1.0.0"));
        assert!(is_update("2024-01", "2024-02"));
    }

    #[tokio::test]
    async fn test_uninstall_purges_instances() {
        let fx = fixture(&[zoro_registry()]);
        assert!(fx.manager.install_extension("zoro-anime").await.success);
        fx.manager.load_extension("zoro-anime").await.unwrap();
        assert_eq!(fx.manager.cache.keys(), vec!["zoro-anime:createZoro".to_string()]);

        assert!(fx.manager.uninstall_extension("zoro-anime").await);
        assert!(fx.manager.cache.is_empty());
        assert!(!fx.manager.uninstall_extension("zoro-anime").await);

        let fetches = fx.fetcher.fetch_count();
        let err = fx.manager.load_extension("zoro-anime").await.err().unwrap();
        assert!(matches!(err, ConsumetError::ModuleNotFound(_)));
        assert_eq!(fx.fetcher.fetch_count(), fetches);
    }

    #[tokio::test]
    async fn test_static_binding() {
        let doc = registry_doc(
            "1.0.0",
            r#"{"id": "gogo", "name": "Gogo", "version": "1.0.0", "category": "manga",
                "main": "static://gogo", "factories": ["createGogo"]}"#,
        );
        let fx = fixture(&[doc]);
        fx.manager.bind_static(
            "gogo",
            Arc::new(|_ctx: &ProviderContext| {
                Ok(StaticModule::builder("gogo")
                    .data("name", "Gogo")
                    .method("search", |_| async { Ok(json!({"results": []})) })
                    .method("fetchEpisodeSources", |_| async { Ok(json!({"sources": []})) })
                    .method("fetchEpisodeServers", |_| async { Ok(json!([])) })
                    .shared())
            }),
        );

        let result = fx.manager.install_extension("gogo").await;
        assert!(result.success);
        assert_eq!(fx.fetcher.probe_count(), 0);

        let provider = fx.manager.create_provider("gogo", "createGogo").await.unwrap();
        assert_eq!(provider.name(), "Gogo");
        assert_eq!(provider.instance().backend(), "static");
        assert_eq!(fx.fetcher.fetch_count(), 0);
        assert_eq!(fx.backend.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_installed_set_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state").join("installed.json");

        let fx = fixture(&[zoro_registry()]);
        let manager = fx.manager.with_state_file(&state);
        assert!(manager.install_extension("zoro-anime").await.success);
        assert!(state.exists());

        let restarted = fixture(&[zoro_registry()]).manager.with_state_file(&state);
        assert_eq!(restarted.restore_state().await.unwrap(), 1);
        assert!(restarted.is_installed("zoro-anime").await);
        assert_eq!(restarted.list_installed().await[0].version, "1.0.0");
    }
}
