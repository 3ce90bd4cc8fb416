//! Extension manifest and registry document types
//!
//! These mirror the JSON registry format published by extension repositories.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of `main` values that bind to a statically compiled implementation
pub const STATIC_SCHEME: &str = "static://";

/// Content category an extension provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionCategory {
    Anime,
    Movies,
    Manga,
    Meta,
}

impl fmt::Display for ExtensionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtensionCategory::Anime => "anime",
            ExtensionCategory::Movies => "movies",
            ExtensionCategory::Manga => "manga",
            ExtensionCategory::Meta => "meta",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ExtensionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anime" => Ok(ExtensionCategory::Anime),
            "movies" | "movie" => Ok(ExtensionCategory::Movies),
            "manga" => Ok(ExtensionCategory::Manga),
            "meta" => Ok(ExtensionCategory::Meta),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}

/// Maintenance status of an extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionStatus {
    #[default]
    Stable,
    Beta,
    Broken,
}

impl fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtensionStatus::Stable => "stable",
            ExtensionStatus::Beta => "beta",
            ExtensionStatus::Broken => "broken",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ExtensionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stable" => Ok(ExtensionStatus::Stable),
            "beta" => Ok(ExtensionStatus::Beta),
            "broken" => Ok(ExtensionStatus::Broken),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// One provider entry of a registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    pub category: ExtensionCategory,
    /// Source URL, or `static://<id>`
    pub main: String,
    #[serde(default, alias = "factoryName", deserialize_with = "one_or_many")]
    pub factories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub status: ExtensionStatus,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

impl ExtensionManifest {
    /// The factory used when the caller does not name one
    pub fn factory_name(&self) -> Option<&str> {
        self.factories.first().map(String::as_str)
    }

    pub fn has_factory(&self, name: &str) -> bool {
        self.factories.iter().any(|f| f == name)
    }

    pub fn is_static(&self) -> bool {
        self.main.starts_with(STATIC_SCHEME)
    }

    /// Id bound by a `static://<id>` main
    pub fn static_binding(&self) -> Option<&str> {
        self.main.strip_prefix(STATIC_SCHEME)
    }
}

/// One extractor entry of a registry, keyed by lower-cased name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorInfo {
    pub name: String,
    pub version: String,
    pub main: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_name: Option<String>,
}

impl ExtractorInfo {
    /// Factory name, defaulting to `create<Name>`
    pub fn factory(&self) -> String {
        match &self.factory_name {
            Some(name) => name.clone(),
            None => {
                let mut chars = self.name.chars();
                match chars.next() {
                    Some(first) => format!("create{}{}", first.to_uppercase(), chars.as_str()),
                    None => "create".to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub last_updated: String,
}

/// A registry document as published by a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRegistry {
    pub metadata: RegistryMetadata,
    #[serde(default)]
    pub extensions: Vec<ExtensionManifest>,
    #[serde(default)]
    pub extractors: Vec<ExtractorInfo>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(name) => vec![name],
        OneOrMany::Many(names) => names,
    })
}
