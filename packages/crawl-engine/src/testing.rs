//! Scripted collaborator implementations so the engine (and crates
//! built on it) can be exercised without network I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::traits::{FetchedPage, ListingParser, PageFetcher};
use crate::types::ExtractedListing;

enum Scripted {
    Page(FetchedPage),
    Error(String),
}

/// Fetcher that replays scripted responses per URL, falling back to a
/// default response. Unscripted URLs without a default fail as
/// transport errors.
pub struct ScriptedFetcher {
    scripted: Mutex<HashMap<String, VecDeque<Scripted>>>,
    default: Mutex<Option<FetchedPage>>,
    requests: AtomicUsize,
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            default: Mutex::new(None),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn default_response(page: FetchedPage) -> Self {
        let fetcher = Self::new();
        fetcher.set_default(page);
        fetcher
    }

    pub fn set_default(&self, page: FetchedPage) {
        *self.default.lock().unwrap() = Some(page);
    }

    pub fn push_response(&self, url: impl Into<String>, page: FetchedPage) {
        self.scripted
            .lock()
            .unwrap()
            .entry(url.into())
            .or_default()
            .push_back(Scripted::Page(page));
    }

    pub fn push_error(&self, url: impl Into<String>, message: impl Into<String>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(url.into())
            .or_default()
            .push_back(Scripted::Error(message.into()));
    }

    /// Total fetches attempted so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(Scripted::Page(page)) => Ok(page),
            Some(Scripted::Error(message)) => Err(EngineError::Fetch {
                url: url.to_string(),
                message,
            }),
            None => match self.default.lock().unwrap().clone() {
                Some(page) => Ok(page),
                None => Err(EngineError::Fetch {
                    url: url.to_string(),
                    message: "no scripted response".to_string(),
                }),
            },
        }
    }
}

#[derive(Deserialize)]
struct JsonListing {
    canonical_url: String,
    fields: serde_json::Value,
}

/// Parser that reads the page body as a JSON array of
/// `{canonical_url, fields}` objects, ignoring the selector blob.
pub struct StaticJsonParser;

impl ListingParser for StaticJsonParser {
    fn parse(&self, body: &str, _selectors: &serde_json::Value) -> Result<Vec<ExtractedListing>> {
        let listings: Vec<JsonListing> = serde_json::from_str(body.trim())
            .map_err(|e| EngineError::Parse(e.to_string()))?;
        Ok(listings
            .into_iter()
            .map(|l| ExtractedListing::new(l.canonical_url, l.fields))
            .collect())
    }
}
