//! Plain HTTP fetcher. The production deployment swaps in a headless
//! renderer behind the same trait; for CSS-selector sites a direct
//! request is enough.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use crawl_engine::{EngineError, FetchedPage, PageFetcher, Result};

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        // Use a browser-like User-Agent to avoid trivial bot detection
        let user_agent = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".parse()?,
        );
        headers.insert(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.5".parse()?);
        headers.insert(reqwest::header::CONNECTION, "keep-alive".parse()?);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        // Blocked responses still carry a body; the classifier sorts
        // them out, so a non-2xx status is not an error here.
        let body = response.text().await.map_err(|e| EngineError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        Ok(FetchedPage {
            status,
            body,
            headers,
        })
    }
}
