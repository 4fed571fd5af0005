//! Storage traits for the four collections the engine owns, split by
//! concern:
//! - `SiteConfigStore`: durable per-site settings
//! - `JobLedger`: job lifecycle records
//! - `CrawlStateStore`: per-URL dedup / change-detection state
//! - `RateLimitEventSink`: append-only block diagnostics
//!
//! `ListingStore` is the *downstream* store the engine hands New and
//! Updated listings to; it is a collaborator, not engine-owned state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    CrawlJob, CrawlMode, CrawlStateEntry, ExtractedListing, RateLimitEvent, SiteConfig,
    SiteStatus, UrlHash,
};

#[async_trait]
pub trait SiteConfigStore: Send + Sync {
    async fn get_site(&self, domain: &str) -> Result<Option<SiteConfig>>;

    async fn list_sites(&self) -> Result<Vec<SiteConfig>>;

    /// Insert or replace a site's configuration.
    async fn upsert_site(&self, site: &SiteConfig) -> Result<()>;

    async fn update_status(&self, domain: &str, status: SiteStatus) -> Result<()>;

    /// Soft-disable / re-enable; sites are never deleted.
    async fn set_enabled(&self, domain: &str, enabled: bool) -> Result<()>;

    /// Stamp the matching last-crawl timestamp after a completed job.
    async fn mark_crawled(&self, domain: &str, mode: CrawlMode, at: DateTime<Utc>) -> Result<()>;

    /// Sites the orchestrator may crawl: enabled and Active or
    /// RateLimited. Blocked and Failed sites stay out until a human
    /// re-enables them.
    async fn eligible_sites(&self) -> Result<Vec<SiteConfig>> {
        Ok(self
            .list_sites()
            .await?
            .into_iter()
            .filter(SiteConfig::is_eligible)
            .collect())
    }
}

#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn create_job(&self, job: &CrawlJob) -> Result<()>;

    /// Persist a job's terminal state and final counters.
    async fn finish_job(&self, job: &CrawlJob) -> Result<()>;

    /// Most recent *completed* job for a site, the precise resume
    /// anchor. Running and failed jobs don't count.
    async fn last_completed_job(&self, site: &str) -> Result<Option<CrawlJob>>;

    /// Recent jobs for a site, newest first.
    async fn recent_jobs(&self, site: &str, limit: usize) -> Result<Vec<CrawlJob>>;
}

#[async_trait]
pub trait CrawlStateStore: Send + Sync {
    async fn lookup(&self, site: &str, url_hash: &UrlHash) -> Result<Option<CrawlStateEntry>>;

    /// Insert or replace the entry for `(site, url_hash)`.
    async fn upsert(&self, entry: &CrawlStateEntry) -> Result<()>;

    async fn count_entries(&self, site: &str) -> Result<u64>;
}

#[async_trait]
pub trait RateLimitEventSink: Send + Sync {
    async fn append(&self, event: &RateLimitEvent) -> Result<()>;
}

/// Composite trait for the engine-owned collections.
pub trait CrawlStore: SiteConfigStore + JobLedger + CrawlStateStore + RateLimitEventSink {}

// Blanket implementation: anything implementing all four is a CrawlStore
impl<T: SiteConfigStore + JobLedger + CrawlStateStore + RateLimitEventSink> CrawlStore for T {}

/// Downstream store for parsed listings.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Persist a new or updated listing, returning its record id.
    async fn save(&self, site: &str, listing: &ExtractedListing) -> Result<String>;

    /// Records held for a site; the resume estimate when no completed
    /// job exists.
    async fn count_for_site(&self, site: &str) -> Result<u64>;
}
