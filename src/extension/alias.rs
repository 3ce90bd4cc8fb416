//! Extractor name alias resolution
//!
//! Maps raw server names as scraped from provider pages (`MegaCloud`,
//! `megacloud-hd-1`, `upcloud`) to the canonical extractor name.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref KNOWN_SUFFIX: Regex = Regex::new(r"(-hd-\d+|-pahe|-backup)$").unwrap();
    static ref ALIASES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("upcloud", "megacloud");
        m.insert("akcloud", "megacloud");
        m
    };
}

/// Canonical extractor name for a raw server name
pub fn extract_base_extractor_name(raw: &str) -> String {
    let mut name = raw.trim().to_lowercase();

    while let Some(found) = KNOWN_SUFFIX.find(&name) {
        name.truncate(found.start());
    }

    // Any other `-<token>` suffix is a variant of the same server
    if let Some(idx) = name.find('-') {
        if idx > 0 {
            name.truncate(idx);
        }
    }

    let name = name.trim();
    match ALIASES.get(name) {
        Some(canonical) => canonical.to_string(),
        None => name.to_string(),
    }
}
