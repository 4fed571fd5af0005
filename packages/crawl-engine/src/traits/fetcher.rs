use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// A fetched page as the classifier sees it.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
}

impl FetchedPage {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// External page fetcher (headless browser, plain HTTP client, ...).
///
/// Failures are transport errors and feed the worker's circuit
/// breaker; a blocked-but-delivered page is a success here and is
/// sorted out by the classifier.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}
