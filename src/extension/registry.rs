//! Extension registry implementation
//!
//! This module provides the in-memory catalog built from one or more
//! registry documents. Documents are unioned: searches see every entry of
//! every document, while lookups by id are last-write-wins.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::alias::extract_base_extractor_name;
use super::types::{
    ExtensionCategory, ExtensionManifest, ExtensionRegistry, ExtensionStatus, ExtractorInfo,
    RegistryMetadata,
};
use crate::core::error::{ConsumetError, Result};

/// Search filters; every field that is set must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    pub category: Option<ExtensionCategory>,
    pub status: Option<ExtensionStatus>,
    pub nsfw: Option<bool>,
    pub language: Option<String>,
    /// Matches when the manifest carries any of these tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Case-insensitive substring of name or description
    pub query: Option<String>,
}

impl SearchFilters {
    pub fn category(category: ExtensionCategory) -> Self {
        Self {
            category: Some(category),
            ..Default::default()
        }
    }

    pub fn matches(&self, manifest: &ExtensionManifest) -> bool {
        if let Some(category) = self.category {
            if manifest.category != category {
                return false;
            }
        }

        if let Some(status) = self.status {
            if manifest.status != status {
                return false;
            }
        }

        if let Some(nsfw) = self.nsfw {
            if manifest.nsfw != nsfw {
                return false;
            }
        }

        if let Some(language) = &self.language {
            if !manifest.languages.iter().any(|l| l.eq_ignore_ascii_case(language)) {
                return false;
            }
        }

        if !self.tags.is_empty() {
            let any_tag = self
                .tags
                .iter()
                .any(|tag| manifest.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)));
            if !any_tag {
                return false;
            }
        }

        if let Some(query) = &self.query {
            let query = query.to_lowercase();
            let in_name = manifest.name.to_lowercase().contains(&query);
            let in_description = manifest
                .description
                .as_ref()
                .map_or(false, |d| d.to_lowercase().contains(&query));
            if !in_name && !in_description {
                return false;
            }
        }

        true
    }
}

/// Union of loaded registry documents
#[derive(Debug, Default, Clone)]
pub struct Registry {
    /// Documents in load order
    documents: Vec<ExtensionRegistry>,

    /// Extension id -> manifest of the last document defining it
    extensions: HashMap<String, ExtensionManifest>,

    /// Canonical extractor name -> info
    ///
    /// An entry already named canonically beats an alias entry (`UpCloud`);
    /// otherwise the last document wins.
    extractors: HashMap<String, ExtractorInfo>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registry document to the union
    pub fn load_registry(&mut self, doc: ExtensionRegistry) {
        tracing::info!(
            registry = %doc.metadata.name,
            version = %doc.metadata.version,
            extensions = doc.extensions.len(),
            extractors = doc.extractors.len(),
            "Loading registry"
        );

        for manifest in &doc.extensions {
            if let Some(previous) = self.extensions.insert(manifest.id.clone(), manifest.clone()) {
                tracing::debug!(
                    extension = %manifest.id,
                    previous = %previous.version,
                    current = %manifest.version,
                    "Manifest redefined by a later registry"
                );
            }
        }

        for info in &doc.extractors {
            let key = extract_base_extractor_name(&info.name);
            let is_canonical = |entry: &ExtractorInfo| entry.name.trim().to_lowercase() == key;
            match self.extractors.get(&key) {
                Some(existing) if is_canonical(existing) && !is_canonical(info) => {
                    tracing::debug!(
                        extractor = %info.name,
                        canonical = %existing.name,
                        "Alias entry shadowed by canonical extractor"
                    );
                }
                _ => {
                    self.extractors.insert(key, info.clone());
                }
            }
        }

        self.documents.push(doc);
    }

    pub fn load_registry_from_str(&mut self, json: &str) -> Result<()> {
        let doc: ExtensionRegistry = serde_json::from_str(json)
            .map_err(|e| ConsumetError::RegistryError(format!("invalid registry document: {}", e)))?;
        self.load_registry(doc);
        Ok(())
    }

    pub fn get_extension_metadata(&self, id: &str) -> Option<&ExtensionManifest> {
        self.extensions.get(id)
    }

    /// Every manifest of every document matching `filters`, in load order
    pub fn search_extensions(&self, filters: &SearchFilters) -> Vec<&ExtensionManifest> {
        self.documents
            .iter()
            .flat_map(|doc| doc.extensions.iter())
            .filter(|manifest| filters.matches(manifest))
            .collect()
    }

    pub fn get_extensions_by_category(&self, category: ExtensionCategory) -> Vec<&ExtensionManifest> {
        self.search_extensions(&SearchFilters::category(category))
    }

    /// Extractor for a raw server name, resolved through its canonical form
    pub fn get_extractor_info(&self, name: &str) -> Option<&ExtractorInfo> {
        self.extractors.get(&extract_base_extractor_name(name))
    }

    pub fn list_extractors(&self) -> Vec<&ExtractorInfo> {
        let mut extractors: Vec<_> = self.extractors.values().collect();
        extractors.sort_by(|a, b| a.name.cmp(&b.name));
        extractors
    }

    pub fn registries(&self) -> Vec<&RegistryMetadata> {
        self.documents.iter().map(|doc| &doc.metadata).collect()
    }

    /// Newest manifest for `id` across all documents
    ///
    /// Semver-parseable versions are ordered; otherwise the last definition wins.
    pub fn latest_manifest(&self, id: &str) -> Option<&ExtensionManifest> {
        let candidates: Vec<&ExtensionManifest> = self
            .documents
            .iter()
            .flat_map(|doc| doc.extensions.iter())
            .filter(|m| m.id == id)
            .collect();

        let parsed: Option<Vec<(Version, &ExtensionManifest)>> = candidates
            .iter()
            .map(|m| Version::parse(&m.version).ok().map(|v| (v, *m)))
            .collect();

        match parsed {
            Some(mut versions) if !versions.is_empty() => {
                // Stable sort keeps the later document on equal versions
                versions.sort_by(|a, b| a.0.cmp(&b.0));
                versions.last().map(|(_, m)| *m)
            }
            _ => candidates.last().copied(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(id: &str, version: &str, category: &str, status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": id,
            "version": version,
            "category": category,
            "main": format!("https://cdn.example.com/{}.js", id),
            "factories": ["create"],
            "status": status,
            "languages": ["en"],
            "tags": ["sub"]
        })
    }

    fn doc(name: &str, extensions: Vec<serde_json::Value>) -> ExtensionRegistry {
        serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "version": "1.0.0",
                "url": format!("https://{}.example.com/registry.json", name),
                "lastUpdated": "2024-01-01T00:00:00Z"
            },
            "extensions": extensions,
            "extractors": [
                {"name": "MegaCloud", "version": "1.0.0", "main": "https://cdn.example.com/megacloud.js"}
            ]
        }))
        .unwrap()
    }

    fn two_registries() -> Registry {
        let mut registry = Registry::new();
        registry.load_registry(doc(
            "official",
            vec![
                manifest("zoro-anime", "1.0.0", "anime", "stable"),
                manifest("flixhq", "1.0.0", "movies", "stable"),
            ],
        ));
        registry.load_registry(doc(
            "community",
            vec![
                manifest("zoro-anime", "1.1.0", "anime", "beta"),
                manifest("mangadex", "0.3.0", "manga", "stable"),
            ],
        ));
        registry
    }

    #[test]
    fn test_union_and_filter() {
        let registry = two_registries();

        let anime = registry.search_extensions(&SearchFilters::category(ExtensionCategory::Anime));
        assert_eq!(anime.len(), 2);
        assert_eq!(anime[0].version, "1.0.0");
        assert_eq!(anime[1].version, "1.1.0");

        let stable_anime = registry.search_extensions(&SearchFilters {
            category: Some(ExtensionCategory::Anime),
            status: Some(ExtensionStatus::Stable),
            ..Default::default()
        });
        assert_eq!(stable_anime.len(), 1);
        assert!(stable_anime.iter().all(|m| m.status == ExtensionStatus::Stable));
    }

    #[test]
    fn test_lookup_is_last_write_wins() {
        let registry = two_registries();
        assert_eq!(registry.get_extension_metadata("zoro-anime").unwrap().version, "1.1.0");
        assert!(registry.get_extension_metadata("unknown").is_none());
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.registries().len(), 2);
    }

    #[test]
    fn test_query_tags_and_language() {
        let mut registry = Registry::new();
        registry.load_registry(doc(
            "official",
            vec![json!({
                "id": "hianime",
                "name": "HiAnime",
                "description": "Watch anime with English subtitles",
                "version": "1.0.0",
                "category": "anime",
                "main": "https://cdn.example.com/hianime.js",
                "factories": ["createHiAnime"],
                "tags": ["Sub", "dub"],
                "languages": ["en", "ja"],
                "nsfw": false
            })],
        ));

        let by_description = SearchFilters {
            query: Some("SUBTITLES".to_string()),
            ..Default::default()
        };
        assert_eq!(registry.search_extensions(&by_description).len(), 1);

        let by_tag = SearchFilters {
            tags: vec!["raw".to_string(), "sub".to_string()],
            ..Default::default()
        };
        assert_eq!(registry.search_extensions(&by_tag).len(), 1);

        let wrong_language = SearchFilters {
            language: Some("fr".to_string()),
            query: Some("hianime".to_string()),
            ..Default::default()
        };
        assert!(registry.search_extensions(&wrong_language).is_empty());

        let nsfw_only = SearchFilters {
            nsfw: Some(true),
            ..Default::default()
        };
        assert!(registry.search_extensions(&nsfw_only).is_empty());
    }

    #[test]
    fn test_extractor_lookup_resolves_aliases() {
        let registry = two_registries();
        assert_eq!(registry.get_extractor_info("megacloud").unwrap().name, "MegaCloud");
        assert_eq!(registry.get_extractor_info("UpCloud").unwrap().name, "MegaCloud");
        assert_eq!(registry.get_extractor_info("megacloud-hd-1").unwrap().name, "MegaCloud");
        assert!(registry.get_extractor_info("kwik").is_none());
        assert_eq!(registry.list_extractors().len(), 1);
    }

    #[test]
    fn test_canonical_extractor_entry_wins_over_alias_entry() {
        for names in [["UpCloud", "MegaCloud"], ["MegaCloud", "UpCloud"]] {
            let mut registry = Registry::new();
            let extractors: Vec<_> = names
                .iter()
                .map(|name| json!({"name": name, "version": "1.0.0", "main": format!("https://cdn.example.com/{}.js", name)}))
                .collect();
            registry.load_registry(
                serde_json::from_value(json!({
                    "metadata": {"name": "official", "version": "1.0.0"},
                    "extensions": [],
                    "extractors": extractors
                }))
                .unwrap(),
            );

            for request in ["upcloud", "UpCloud", "megacloud", "akcloud-hd-2"] {
                assert_eq!(registry.get_extractor_info(request).unwrap().name, "MegaCloud", "{:?}", names);
            }
        }
    }

    #[test]
    fn test_latest_manifest_orders_semver() {
        let mut registry = Registry::new();
        registry.load_registry(doc("a", vec![manifest("gogo", "1.10.0", "anime", "stable")]));
        registry.load_registry(doc("b", vec![manifest("gogo", "1.9.0", "anime", "stable")]));

        assert_eq!(registry.latest_manifest("gogo").unwrap().version, "1.10.0");
        assert_eq!(registry.get_extension_metadata("gogo").unwrap().version, "1.9.0");
    }

    #[test]
    fn test_invalid_document() {
        let mut registry = Registry::new();
        let err = registry.load_registry_from_str("{\"extensions\": []}").unwrap_err();
        assert!(matches!(err, ConsumetError::RegistryError(_)));
        assert!(registry.is_empty());
    }
}
