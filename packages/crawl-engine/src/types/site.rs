use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::job::CrawlMode;

/// Operational status of a site.
///
/// Only `Active` and `RateLimited` sites are picked up by the
/// orchestrator; `Blocked` and `Failed` stay excluded until a human
/// re-enables them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteStatus {
    Active,
    RateLimited,
    Blocked,
    Failed,
    Disabled,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "rate_limited" => Ok(Self::RateLimited),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            "disabled" => Ok(Self::Disabled),
            other => Err(EngineError::Config {
                reason: format!("unknown site status: {other}"),
            }),
        }
    }
}

/// How a site's listing pages are enumerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    /// URL pattern with a `{page}` placeholder, resolved against the
    /// site's base URL when relative.
    pub url_pattern: String,
    /// Upper bound on pages for a full crawl.
    pub max_pages: u32,
    /// Listings per page, used to estimate a resume point when no
    /// completed job exists.
    pub items_per_page: u32,
}

impl Pagination {
    /// Build the concrete URL for a page number.
    pub fn page_url(&self, base_url: &str, page: u32) -> String {
        let path = self.url_pattern.replace("{page}", &page.to_string());
        if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
        }
    }
}

/// Durable per-site crawl settings.
///
/// Created out-of-band; the engine only mutates `status` and the
/// last-crawl timestamps. Sites are never deleted, only disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Domain, the primary key.
    pub domain: String,
    /// Human-readable display name.
    pub name: String,
    pub base_url: String,
    /// Opaque selector set handed to the external parser untouched.
    pub selectors: serde_json::Value,
    pub pagination: Pagination,
    /// Mandatory spacing before every fetch, in seconds.
    pub rate_limit_secs: u64,
    /// Concurrent page fetches for this site, independent of the
    /// orchestrator's global bound.
    pub max_workers: usize,
    /// Desired hours between crawls of this site.
    pub crawl_cadence_hours: u32,
    pub enabled: bool,
    pub status: SiteStatus,
    pub notes: Option<String>,
    pub last_full_crawl: Option<DateTime<Utc>>,
    pub last_incremental_crawl: Option<DateTime<Utc>>,
}

impl SiteConfig {
    pub fn new(domain: impl Into<String>, name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
            base_url: base_url.into(),
            selectors: serde_json::Value::Null,
            pagination: Pagination {
                url_pattern: "?page={page}".to_string(),
                max_pages: 100,
                items_per_page: 24,
            },
            rate_limit_secs: 2,
            max_workers: 2,
            crawl_cadence_hours: 24,
            enabled: true,
            status: SiteStatus::Active,
            notes: None,
            last_full_crawl: None,
            last_incremental_crawl: None,
        }
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_selectors(mut self, selectors: serde_json::Value) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn with_rate_limit(mut self, secs: u64) -> Self {
        self.rate_limit_secs = secs;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Whether the orchestrator should pick this site up.
    pub fn is_eligible(&self) -> bool {
        self.enabled && matches!(self.status, SiteStatus::Active | SiteStatus::RateLimited)
    }

    /// Whether the site is due for another crawl of the given mode.
    pub fn is_due(&self, mode: CrawlMode, now: DateTime<Utc>) -> bool {
        let last = match mode {
            CrawlMode::Full => self.last_full_crawl,
            CrawlMode::Incremental => self.last_incremental_crawl,
        };
        match last {
            Some(at) => now - at >= chrono::Duration::hours(i64::from(self.crawl_cadence_hours)),
            None => true,
        }
    }
}
