//! Contracts with external collaborators and the storage layer.

pub mod fetcher;
pub mod parser;
pub mod store;

pub use fetcher::{FetchedPage, PageFetcher};
pub use parser::ListingParser;
pub use store::{
    CrawlStateStore, CrawlStore, JobLedger, ListingStore, RateLimitEventSink, SiteConfigStore,
};
