//! Cross-site orchestration: one worker task per eligible site, all
//! gated by a single global semaphore so the number of concurrently
//! crawled sites stays bounded no matter how many are enabled.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::Result;
use crate::traits::{CrawlStore, ListingParser, ListingStore, PageFetcher, SiteConfigStore};
use crate::types::{CrawlJob, CrawlMode, JobStatus, SiteConfig};
use crate::worker::SiteCrawlWorker;

/// Default cap on concurrently crawled sites.
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 3;

/// Aggregated outcome of one orchestrator run.
#[derive(Debug, Default)]
pub struct CrawlSummary {
    pub jobs: Vec<CrawlJob>,
    pub sites_succeeded: u32,
    pub sites_failed: u32,
}

impl CrawlSummary {
    fn record(&mut self, job: CrawlJob) {
        if job.status == JobStatus::Completed {
            self.sites_succeeded += 1;
        } else {
            self.sites_failed += 1;
        }
        self.jobs.push(job);
    }
}

pub struct Orchestrator {
    store: Arc<dyn CrawlStore>,
    listings: Arc<dyn ListingStore>,
    fetcher: Arc<dyn PageFetcher>,
    parser: Arc<dyn ListingParser>,
    global_concurrency: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CrawlStore>,
        listings: Arc<dyn ListingStore>,
        fetcher: Arc<dyn PageFetcher>,
        parser: Arc<dyn ListingParser>,
    ) -> Self {
        Self {
            store,
            listings,
            fetcher,
            parser,
            global_concurrency: DEFAULT_GLOBAL_CONCURRENCY,
        }
    }

    pub fn with_global_concurrency(mut self, limit: usize) -> Self {
        self.global_concurrency = limit.max(1);
        self
    }

    /// Crawl every eligible site: enabled and Active or RateLimited.
    /// Blocked and Failed sites are excluded until a human re-enables
    /// them; the engine never auto-recovers them.
    pub async fn run_all(&self, mode: CrawlMode) -> Result<CrawlSummary> {
        let sites = self.store.eligible_sites().await?;
        self.run_sites(sites, mode).await
    }

    /// Crawl an explicit set of sites under the global bound.
    pub async fn run_sites(&self, sites: Vec<SiteConfig>, mode: CrawlMode) -> Result<CrawlSummary> {
        info!(
            sites = sites.len(),
            mode = mode.as_str(),
            limit = self.global_concurrency,
            "Starting orchestrated crawl"
        );

        let semaphore = Arc::new(Semaphore::new(self.global_concurrency));
        let mut handles = Vec::with_capacity(sites.len());

        for site in sites {
            let semaphore = Arc::clone(&semaphore);
            let worker = SiteCrawlWorker::new(
                Arc::clone(&self.store),
                Arc::clone(&self.listings),
                Arc::clone(&self.fetcher),
                Arc::clone(&self.parser),
            );
            handles.push(tokio::spawn(async move {
                // Never closed while we hold the Arc.
                let _permit = semaphore.acquire_owned().await.unwrap();
                let domain = site.domain.clone();
                (domain, worker.run(&site, mode).await)
            }));
        }

        // Await all workers; one site's failure never cancels or
        // degrades its siblings.
        let mut summary = CrawlSummary::default();
        for handle in handles {
            match handle.await {
                Ok((_, Ok(job))) => summary.record(job),
                Ok((domain, Err(e))) => {
                    warn!(site = %domain, error = %e, "Site worker failed");
                    summary.sites_failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Site worker panicked");
                    summary.sites_failed += 1;
                }
            }
        }

        info!(
            succeeded = summary.sites_succeeded,
            failed = summary.sites_failed,
            "Orchestrated crawl finished"
        );
        Ok(summary)
    }
}
