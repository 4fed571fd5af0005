//! CSS-selector listing parser.
//!
//! The engine treats a site's selector blob as opaque; this parser is
//! the collaborator that gives it meaning. Expected shape:
//!
//! ```json
//! {
//!   "item": "div.listing-card",
//!   "link": "a.title",
//!   "base_url": "https://example.com",
//!   "fields": { "title": "a.title", "price": ".price", "location": ".area" }
//! }
//! ```

use std::collections::BTreeMap;

use crawl_engine::{EngineError, ExtractedListing, ListingParser, Result};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::warn;
use url::Url;

#[derive(Debug, Deserialize)]
struct SelectorSet {
    /// Selector matching one listing card.
    item: String,
    /// Selector, within a card, for the anchor carrying the listing URL.
    link: String,
    /// Base URL used to absolutize relative listing links.
    #[serde(default)]
    base_url: Option<String>,
    /// Field name to selector, each yielding the element's text.
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

pub struct CssListingParser;

impl CssListingParser {
    fn compile(selector: &str) -> Result<Selector> {
        Selector::parse(selector)
            .map_err(|e| EngineError::Parse(format!("bad selector {selector:?}: {e}")))
    }
}

impl ListingParser for CssListingParser {
    fn parse(&self, body: &str, selectors: &serde_json::Value) -> Result<Vec<ExtractedListing>> {
        let set: SelectorSet = serde_json::from_value(selectors.clone())
            .map_err(|e| EngineError::Parse(format!("invalid selector set: {e}")))?;

        let item_sel = Self::compile(&set.item)?;
        let link_sel = Self::compile(&set.link)?;
        let field_sels: Vec<(String, Selector)> = set
            .fields
            .iter()
            .map(|(name, sel)| Ok((name.clone(), Self::compile(sel)?)))
            .collect::<Result<_>>()?;

        let base = set
            .base_url
            .as_deref()
            .and_then(|b| Url::parse(b).ok());

        let document = Html::parse_document(body);
        let mut listings = Vec::new();

        for card in document.select(&item_sel) {
            let Some(href) = card
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
            else {
                // Listing-level failure: skip the card, keep the page.
                warn!(selector = %set.link, "Listing card without a link, skipped");
                continue;
            };

            let canonical_url = match &base {
                Some(base) => base
                    .join(href)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| href.to_string()),
                None => href.to_string(),
            };

            let mut fields = serde_json::Map::new();
            for (name, sel) in &field_sels {
                if let Some(el) = card.select(sel).next() {
                    let text = el.text().collect::<String>().trim().to_string();
                    fields.insert(name.clone(), serde_json::Value::String(text));
                }
            }

            listings.push(ExtractedListing::new(
                canonical_url,
                serde_json::Value::Object(fields),
            ));
        }

        Ok(listings)
    }
}
