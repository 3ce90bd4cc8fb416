//! HTML parsing capability behind the `cheerio` shim
//!
//! Isolates only exchange HTML strings with the host, so every node is
//! returned with its own outer HTML and later queries re-parse that fragment.

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::error::{ConsumetError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtmlNode {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub inner_html: String,
    pub outer_html: String,
}

impl HtmlNode {
    fn from_element(element: ElementRef<'_>) -> Self {
        Self {
            tag: element.value().name().to_string(),
            attrs: element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            text: element.text().collect::<String>(),
            inner_html: element.inner_html(),
            outer_html: element.html(),
        }
    }
}

/// Where a selector is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectScope {
    /// The input is a whole document
    Document,
    /// The input is one element; only its descendants match
    Descendants,
}

pub trait HtmlParser: Send + Sync {
    fn select(&self, html: &str, selector: &str, scope: SelectScope) -> Result<Vec<HtmlNode>>;

    /// Direct element children of the element `html`, optionally filtered
    fn children(&self, html: &str, selector: Option<&str>) -> Result<Vec<HtmlNode>>;

    /// Text content of a whole document or fragment
    fn text(&self, html: &str) -> String;
}

pub type SharedHtmlParser = Arc<dyn HtmlParser>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScraperHtmlParser;

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| ConsumetError::ExecutionError(format!("invalid selector '{}': {}", selector, e)))
}

/// First element under the fragment root
fn fragment_element(fragment: &Html) -> Option<ElementRef<'_>> {
    fragment.root_element().children().find_map(ElementRef::wrap)
}

impl HtmlParser for ScraperHtmlParser {
    fn select(&self, html: &str, selector: &str, scope: SelectScope) -> Result<Vec<HtmlNode>> {
        let selector = parse_selector(selector)?;

        match scope {
            SelectScope::Document => {
                let document = Html::parse_document(html);
                Ok(document.select(&selector).map(HtmlNode::from_element).collect())
            }
            SelectScope::Descendants => {
                let fragment = Html::parse_fragment(html);
                Ok(fragment_element(&fragment)
                    .map(|element| {
                        element
                            .select(&selector)
                            .filter(|found| found.id() != element.id())
                            .map(HtmlNode::from_element)
                            .collect()
                    })
                    .unwrap_or_default())
            }
        }
    }

    fn children(&self, html: &str, selector: Option<&str>) -> Result<Vec<HtmlNode>> {
        let selector = selector.map(parse_selector).transpose()?;
        let fragment = Html::parse_fragment(html);

        let Some(element) = fragment_element(&fragment) else {
            return Ok(Vec::new());
        };

        Ok(element
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|child| selector.as_ref().map_or(true, |s| s.matches(child)))
            .map(HtmlNode::from_element)
            .collect())
    }

    fn text(&self, html: &str) -> String {
        Html::parse_document(html).root_element().text().collect()
    }
}
