//! Core data model: site configuration, job lifecycle, crawl state,
//! and the opaque listing payload exchanged with collaborators.

pub mod job;
pub mod listing;
pub mod site;
pub mod state;

pub use job::{CrawlJob, CrawlMode, JobCounters, JobId, JobStatus};
pub use listing::{BlockReason, ExtractedListing, RateLimitEvent};
pub use site::{Pagination, SiteConfig, SiteStatus};
pub use state::{ContentHash, CrawlStateEntry, Reconciliation, UrlHash};
