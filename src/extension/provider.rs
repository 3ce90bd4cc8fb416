//! Typed provider and extractor handles
//!
//! Loaded instances only expose `call(name, args) -> Value`. These wrappers
//! give the factory contract methods Rust signatures and decode their results
//! into the shared models. Every error is prefixed with the provider in use.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::instance::{display_name, LoadedExtensionInstance};
use super::models::{EpisodeServer, MediaInfo, SearchResults, Sources};
use super::types::ExtensionCategory;
use crate::core::error::{ConsumetError, Result};

/// Methods of the provider factory contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMethod {
    Search,
    FetchAnimeInfo,
    FetchMediaInfo,
    FetchMangaInfo,
    FetchEpisodeSources,
    FetchEpisodeServers,
}

impl ProviderMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMethod::Search => "search",
            ProviderMethod::FetchAnimeInfo => "fetchAnimeInfo",
            ProviderMethod::FetchMediaInfo => "fetchMediaInfo",
            ProviderMethod::FetchMangaInfo => "fetchMangaInfo",
            ProviderMethod::FetchEpisodeSources => "fetchEpisodeSources",
            ProviderMethod::FetchEpisodeServers => "fetchEpisodeServers",
        }
    }

    /// Info method a provider of `category` is expected to have
    pub fn info_for(category: ExtensionCategory) -> Self {
        match category {
            ExtensionCategory::Movies => ProviderMethod::FetchMediaInfo,
            ExtensionCategory::Manga => ProviderMethod::FetchMangaInfo,
            ExtensionCategory::Anime | ExtensionCategory::Meta => ProviderMethod::FetchAnimeInfo,
        }
    }
}

/// Methods an instance must expose to be accepted as a provider of `category`
pub fn required_methods(category: ExtensionCategory) -> Vec<&'static str> {
    let mut methods = vec![
        ProviderMethod::Search.as_str(),
        ProviderMethod::FetchEpisodeSources.as_str(),
        ProviderMethod::FetchEpisodeServers.as_str(),
    ];
    match category {
        ExtensionCategory::Anime => methods.push(ProviderMethod::FetchAnimeInfo.as_str()),
        ExtensionCategory::Movies => methods.push(ProviderMethod::FetchMediaInfo.as_str()),
        ExtensionCategory::Manga | ExtensionCategory::Meta => {}
    }
    methods
}

/// Check an instance against the factory contract for `category`
///
/// Fails with a `ValidationError` naming the first missing method.
pub fn validate_provider_instance(instance: &LoadedExtensionInstance, category: ExtensionCategory) -> Result<()> {
    for method in required_methods(category) {
        if !instance.has_method(method) {
            return Err(ConsumetError::ValidationError(format!(
                "{} provider {} is missing required method '{}'",
                category,
                instance.id(),
                method
            )));
        }
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(label: &str, method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        ConsumetError::DeserializationError(format!("unexpected {} result: {}", method, e)).with_prefix(label)
    })
}

/// A loaded provider with typed contract methods
#[derive(Clone)]
pub struct Provider {
    category: ExtensionCategory,
    instance: LoadedExtensionInstance,
}

impl Provider {
    pub fn new(category: ExtensionCategory, instance: LoadedExtensionInstance) -> Self {
        Self { category, instance }
    }

    pub fn id(&self) -> &str {
        self.instance.id()
    }

    pub fn name(&self) -> String {
        display_name(self.instance.as_ref())
    }

    pub fn category(&self) -> ExtensionCategory {
        self.category
    }

    pub fn instance(&self) -> &LoadedExtensionInstance {
        &self.instance
    }

    /// Untyped call, with the provider name prefixed on failure
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.instance
            .call(method, args)
            .await
            .map_err(|e| e.with_prefix(&self.name()))
    }

    async fn call_typed<T: DeserializeOwned>(&self, method: ProviderMethod, args: Vec<Value>) -> Result<T> {
        let value = self.call(method.as_str(), args).await?;
        decode(&self.name(), method.as_str(), value)
    }

    pub async fn search(&self, query: &str, page: Option<u32>) -> Result<SearchResults> {
        let mut args = vec![json!(query)];
        if let Some(page) = page {
            args.push(json!(page));
        }
        self.call_typed(ProviderMethod::Search, args).await
    }

    /// `fetchAnimeInfo`, `fetchMediaInfo` or `fetchMangaInfo` by category
    pub async fn fetch_info(&self, id: &str) -> Result<MediaInfo> {
        self.call_typed(ProviderMethod::info_for(self.category), vec![json!(id)])
            .await
    }

    pub async fn fetch_episode_sources(&self, episode_id: &str, server: Option<&str>) -> Result<Sources> {
        let mut args = vec![json!(episode_id)];
        if let Some(server) = server {
            args.push(json!(server));
        }
        let value = self.call(ProviderMethod::FetchEpisodeSources.as_str(), args).await?;
        Sources::from_value(value).map_err(|e| {
            ConsumetError::DeserializationError(format!("unexpected fetchEpisodeSources result: {}", e))
                .with_prefix(&self.name())
        })
    }

    pub async fn fetch_episode_servers(&self, episode_id: &str) -> Result<Vec<EpisodeServer>> {
        self.call_typed(ProviderMethod::FetchEpisodeServers, vec![json!(episode_id)])
            .await
    }
}

/// A loaded extractor
#[derive(Clone)]
pub struct Extractor {
    name: String,
    instance: LoadedExtensionInstance,
}

impl Extractor {
    pub fn new(name: impl Into<String>, instance: LoadedExtensionInstance) -> Self {
        Self {
            name: name.into(),
            instance,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &LoadedExtensionInstance {
        &self.instance
    }

    /// Resolve an embed URL to playable sources
    ///
    /// A bare array result is accepted as the source list.
    pub async fn extract(&self, url: &str, extra: Vec<Value>) -> Result<Sources> {
        let mut args = vec![json!(url)];
        args.extend(extra);
        let value = self
            .instance
            .call("extract", args)
            .await
            .map_err(|e| e.with_prefix(&self.name))?;
        Sources::from_value(value).map_err(|e| {
            ConsumetError::DeserializationError(format!("unexpected extract result: {}", e)).with_prefix(&self.name)
        })
    }
}
