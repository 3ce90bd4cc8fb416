//! Capability context factory
//!
//! A context is the bundle of capabilities handed to a module's factory:
//! an HTTP client, an HTML parser, the user agent, the shared enums and,
//! for providers, access to extractors. Contexts are plain values; every
//! isolate builds its own JS-side object from [`ContextSpec`] and reaches the
//! host capabilities through ops.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::alias::extract_base_extractor_name;
use super::html::{ScraperHtmlParser, SharedHtmlParser};
use super::http::{ReqwestClient, SharedHttpClient};
use super::instance::LoadedExtensionInstance;
use crate::core::config::{HttpConfig, DEFAULT_USER_AGENT};
use crate::core::error::{ConsumetError, Result};

pub const STREAMING_SERVERS: &[(&str, &str)] = &[
    ("AsianLoad", "asianload"),
    ("GogoCDN", "gogocdn"),
    ("StreamSB", "streamsb"),
    ("MixDrop", "mixdrop"),
    ("Mp4Upload", "mp4upload"),
    ("UpCloud", "upcloud"),
    ("VidCloud", "vidcloud"),
    ("StreamTape", "streamtape"),
    ("VizCloud", "vizcloud"),
    ("MyCloud", "mycloud"),
    ("Filemoon", "filemoon"),
    ("VidStreaming", "vidstreaming"),
    ("BuiltIn", "builtin"),
    ("SmashyStream", "smashystream"),
    ("StreamHub", "streamhub"),
    ("StreamWish", "streamwish"),
    ("VidHide", "vidhide"),
    ("VidMoly", "vidmoly"),
    ("Voe", "voe"),
    ("MegaUp", "megaup"),
    ("MegaCloud", "megacloud"),
    ("Kwik", "kwik"),
];

pub const MEDIA_STATUS: &[(&str, &str)] = &[
    ("ONGOING", "Ongoing"),
    ("COMPLETED", "Completed"),
    ("HIATUS", "Hiatus"),
    ("CANCELLED", "Cancelled"),
    ("NOT_YET_AIRED", "Not yet aired"),
    ("UNKNOWN", "Unknown"),
];

pub const SUB_OR_DUB: &[(&str, &str)] = &[("SUB", "sub"), ("DUB", "dub"), ("BOTH", "both")];

pub const TV_TYPE: &[(&str, &str)] = &[
    ("TVSERIES", "TV Series"),
    ("MOVIE", "Movie"),
    ("ANIME", "Anime"),
    ("PODCAST", "Podcast"),
];

pub const MEDIA_FORMAT: &[(&str, &str)] = &[
    ("TV", "TV"),
    ("TV_SHORT", "TV_SHORT"),
    ("MOVIE", "MOVIE"),
    ("SPECIAL", "SPECIAL"),
    ("OVA", "OVA"),
    ("ONA", "ONA"),
    ("MUSIC", "MUSIC"),
    ("MANGA", "MANGA"),
    ("NOVEL", "NOVEL"),
    ("ONE_SHOT", "ONE_SHOT"),
];

pub const GENRES: &[(&str, &str)] = &[
    ("ACTION", "Action"),
    ("ADVENTURE", "Adventure"),
    ("CARS", "Cars"),
    ("COMEDY", "Comedy"),
    ("DRAMA", "Drama"),
    ("FANTASY", "Fantasy"),
    ("HORROR", "Horror"),
    ("MAHOU_SHOUJO", "Mahou Shoujo"),
    ("MECHA", "Mecha"),
    ("MUSIC", "Music"),
    ("MYSTERY", "Mystery"),
    ("PSYCHOLOGICAL", "Psychological"),
    ("ROMANCE", "Romance"),
    ("SCI_FI", "Sci-Fi"),
    ("SLICE_OF_LIFE", "Slice of Life"),
    ("SPORTS", "Sports"),
    ("SUPERNATURAL", "Supernatural"),
    ("THRILLER", "Thriller"),
];

fn table(entries: &[(&str, &str)]) -> Value {
    Value::Object(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect::<Map<String, Value>>(),
    )
}

/// The enums exposed to loaded code, keyed by their JS names
pub fn enums() -> Value {
    let sub_or_dub = table(SUB_OR_DUB);
    let mut enums = Map::new();
    enums.insert("StreamingServers".to_string(), table(STREAMING_SERVERS));
    enums.insert("MediaStatus".to_string(), table(MEDIA_STATUS));
    enums.insert("SubOrSub".to_string(), sub_or_dub.clone());
    enums.insert("SubOrDub".to_string(), sub_or_dub);
    enums.insert("TvType".to_string(), table(TV_TYPE));
    enums.insert("MediaFormat".to_string(), table(MEDIA_FORMAT));
    enums.insert("Genres".to_string(), table(GENRES));
    Value::Object(enums)
}

/// Host-side loader for extractors that are not statically bound
#[async_trait]
pub trait ExtractorResolver: Send + Sync {
    /// Load (or return the cached) extractor for a raw server name
    async fn resolve(&self, name: &str) -> Result<LoadedExtensionInstance>;
}

/// The `extractors` capability of provider contexts
///
/// Lookup order: exact static binding, then the resolver, then a static
/// binding of the canonical name. A resolver failure with a canonical static
/// binding available is logged and absorbed.
#[derive(Clone, Default)]
pub struct Extractors {
    statics: Arc<HashMap<String, LoadedExtensionInstance>>,
    resolver: Option<Arc<dyn ExtractorResolver>>,
}

impl Extractors {
    pub fn new(
        statics: HashMap<String, LoadedExtensionInstance>,
        resolver: Option<Arc<dyn ExtractorResolver>>,
    ) -> Self {
        let statics = statics
            .into_iter()
            .map(|(name, instance)| (name.to_lowercase(), instance))
            .collect();
        Self {
            statics: Arc::new(statics),
            resolver,
        }
    }

    pub fn static_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.statics.keys().cloned().collect();
        names.sort();
        names
    }

    fn exact_static(&self, name: &str) -> Option<&LoadedExtensionInstance> {
        self.statics.get(&name.trim().to_lowercase())
    }

    fn canonical_static(&self, name: &str) -> Option<&LoadedExtensionInstance> {
        self.statics.get(&extract_base_extractor_name(name))
    }

    /// Resolve `name` to a live extractor instance
    pub async fn get(&self, name: &str) -> Result<LoadedExtensionInstance> {
        if let Some(instance) = self.exact_static(name) {
            return Ok(instance.clone());
        }

        if let Some(resolver) = &self.resolver {
            match resolver.resolve(name).await {
                Ok(instance) => return Ok(instance),
                Err(e) => match self.canonical_static(name) {
                    Some(fallback) => {
                        tracing::warn!(
                            extractor = %name,
                            error = %e,
                            "Dynamic extractor failed to load, using static implementation"
                        );
                        return Ok(fallback.clone());
                    }
                    None => return Err(e.with_prefix(name)),
                },
            }
        }

        self.canonical_static(name).cloned().ok_or_else(|| {
            ConsumetError::ModuleNotFound(format!("no extractor available for '{}'", name))
        })
    }

    /// Call `method` on the extractor for `name`
    pub async fn call(&self, name: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let instance = self.get(name).await?;
        instance
            .call(method, args)
            .await
            .map_err(|e| e.with_prefix(name))
    }
}

/// Optional overrides for context construction
#[derive(Clone, Default)]
pub struct ContextConfig {
    pub http_client: Option<SharedHttpClient>,
    pub html_parser: Option<SharedHtmlParser>,
    pub user_agent: Option<String>,
    /// Pre-bound extractor implementations by name
    pub static_extractors: HashMap<String, LoadedExtensionInstance>,
    pub extractor_resolver: Option<Arc<dyn ExtractorResolver>>,
}

/// Capabilities shared by both context kinds
#[derive(Clone)]
pub struct Capabilities {
    pub http: SharedHttpClient,
    pub html: SharedHtmlParser,
    pub user_agent: String,
}

impl Capabilities {
    fn from_config(config: &ContextConfig) -> Result<Self> {
        let http = match &config.http_client {
            Some(client) => client.clone(),
            None => ReqwestClient::shared(&HttpConfig::default())?,
        };
        Ok(Self {
            http,
            html: config
                .html_parser
                .clone()
                .unwrap_or_else(|| Arc::new(ScraperHtmlParser)),
            user_agent: config
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        })
    }
}

#[derive(Clone)]
pub struct ProviderContext {
    pub capabilities: Capabilities,
    pub extractors: Extractors,
}

#[derive(Clone)]
pub struct ExtractorContext {
    pub capabilities: Capabilities,
}

pub fn create_provider_context(config: Option<ContextConfig>) -> Result<ProviderContext> {
    let config = config.unwrap_or_default();
    let capabilities = Capabilities::from_config(&config)?;
    let extractors = Extractors::new(config.static_extractors, config.extractor_resolver);
    Ok(ProviderContext {
        capabilities,
        extractors,
    })
}

pub fn create_extractor_context(config: Option<ContextConfig>) -> Result<ExtractorContext> {
    let config = config.unwrap_or_default();
    Ok(ExtractorContext {
        capabilities: Capabilities::from_config(&config)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Provider,
    Extractor,
}

/// JSON description from which each execution context builds its `ctx`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSpec {
    pub kind: ContextKind,
    pub module_id: String,
    pub user_agent: String,
    pub enums: Value,
}

/// Context passed with one execution request
#[derive(Clone)]
pub enum ModuleContext {
    Provider(ProviderContext),
    Extractor(ExtractorContext),
}

impl ModuleContext {
    pub fn kind(&self) -> ContextKind {
        match self {
            ModuleContext::Provider(_) => ContextKind::Provider,
            ModuleContext::Extractor(_) => ContextKind::Extractor,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        match self {
            ModuleContext::Provider(ctx) => &ctx.capabilities,
            ModuleContext::Extractor(ctx) => &ctx.capabilities,
        }
    }

    /// Extractor access, present for providers only
    pub fn extractors(&self) -> Option<&Extractors> {
        match self {
            ModuleContext::Provider(ctx) => Some(&ctx.extractors),
            ModuleContext::Extractor(_) => None,
        }
    }

    pub fn spec(&self, module_id: &str) -> ContextSpec {
        ContextSpec {
            kind: self.kind(),
            module_id: module_id.to_string(),
            user_agent: self.capabilities().user_agent.clone(),
            enums: enums(),
        }
    }
}

impl From<ProviderContext> for ModuleContext {
    fn from(ctx: ProviderContext) -> Self {
        ModuleContext::Provider(ctx)
    }
}

impl From<ExtractorContext> for ModuleContext {
    fn from(ctx: ExtractorContext) -> Self {
        ModuleContext::Extractor(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::static_module::StaticModule;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingResolver {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ExtractorResolver for FailingResolver {
        async fn resolve(&self, name: &str) -> Result<LoadedExtensionInstance> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ConsumetError::NetworkError(format!("{} unreachable", name)))
        }
    }

    fn megacloud() -> LoadedExtensionInstance {
        StaticModule::builder("megacloud")
            .method("extract", |_| async { Ok(json!({"sources": [], "subtitles": []})) })
            .shared()
    }

    #[test]
    fn test_contexts_are_independent_but_equivalent() {
        let a = create_provider_context(None).unwrap();
        let b = create_provider_context(None).unwrap();

        assert!(!Arc::ptr_eq(&a.capabilities.http, &b.capabilities.http));
        assert_eq!(a.capabilities.user_agent, b.capabilities.user_agent);

        let spec_a = ModuleContext::from(a).spec("zoro");
        let spec_b = ModuleContext::from(b).spec("zoro");
        assert_eq!(spec_a.enums, spec_b.enums);
    }

    #[test]
    fn test_enums_are_populated() {
        let enums = enums();
        assert_eq!(enums["StreamingServers"]["MegaCloud"], "megacloud");
        assert_eq!(enums["SubOrSub"]["DUB"], "dub");
        assert_eq!(enums["SubOrDub"], enums["SubOrSub"]);
        assert_eq!(enums["MediaStatus"]["NOT_YET_AIRED"], "Not yet aired");
        assert_eq!(enums["TvType"]["TVSERIES"], "TV Series");
    }

    #[test]
    fn test_extractor_context_has_no_extractors() {
        let ctx = ModuleContext::from(create_extractor_context(None).unwrap());
        assert!(ctx.extractors().is_none());
        assert_eq!(ctx.spec("kwik").kind, ContextKind::Extractor);
    }

    #[tokio::test]
    async fn test_static_binding_wins_without_resolving() {
        let resolver = Arc::new(FailingResolver { attempts: AtomicUsize::new(0) });
        let mut statics = HashMap::new();
        statics.insert("MegaCloud".to_string(), megacloud());
        let extractors = Extractors::new(statics, Some(resolver.clone()));

        extractors.call("megacloud", "extract", vec![]).await.unwrap();
        assert_eq!(resolver.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dynamic_failure_falls_back_to_canonical_static() {
        let resolver = Arc::new(FailingResolver { attempts: AtomicUsize::new(0) });
        let mut statics = HashMap::new();
        statics.insert("megacloud".to_string(), megacloud());
        let extractors = Extractors::new(statics, Some(resolver.clone()));

        let out = extractors.call("upcloud", "extract", vec![]).await.unwrap();
        assert_eq!(out["sources"], json!([]));
        assert_eq!(resolver.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_without_fallback_surfaces() {
        let resolver = Arc::new(FailingResolver { attempts: AtomicUsize::new(0) });
        let extractors = Extractors::new(HashMap::new(), Some(resolver));

        let err = extractors.call("kwik", "extract", vec![]).await.unwrap_err();
        assert!(matches!(err, ConsumetError::NetworkError(_)));
        assert!(err.to_string().contains("[kwik]"));

        let bare = Extractors::default();
        assert!(matches!(
            bare.call("kwik", "extract", vec![]).await,
            Err(ConsumetError::ModuleNotFound(_))
        ));
    }
}
