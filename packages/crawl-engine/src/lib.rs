//! Incremental multi-site crawl orchestration engine.
//!
//! Decides which listing sites to crawl, detects rate limiting and
//! blocking, tracks per-URL crawl state through content hashing so
//! unchanged listings are never reprocessed, resumes correctly after
//! interruption, and bounds concurrency globally and per site.
//!
//! Fetching and HTML parsing are collaborator seams ([`traits`]);
//! the engine owns the job ledger, crawl state, site configuration,
//! and rate-limit diagnostics.

pub mod classifier;
pub mod error;
pub mod orchestrator;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;
pub mod worker;

// Re-exports for clean API
pub use classifier::classify;
pub use error::{EngineError, Result};
pub use orchestrator::{CrawlSummary, Orchestrator, DEFAULT_GLOBAL_CONCURRENCY};
pub use stores::{MemoryListingStore, MemoryStore, SqliteStore};
pub use traits::{
    CrawlStateStore, CrawlStore, FetchedPage, JobLedger, ListingParser, ListingStore, PageFetcher,
    RateLimitEventSink, SiteConfigStore,
};
pub use types::{
    BlockReason, ContentHash, CrawlJob, CrawlMode, CrawlStateEntry, ExtractedListing, JobCounters,
    JobId, JobStatus, Pagination, RateLimitEvent, Reconciliation, SiteConfig, SiteStatus, UrlHash,
};
pub use worker::{resume_page, SiteCrawlWorker, INCREMENTAL_PAGE_CAP, MAX_CONSECUTIVE_ERRORS};
