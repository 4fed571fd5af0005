//! Per-site crawl loop: fetch pages in bounded batches, classify
//! responses, reconcile parsed listings against crawl state, and keep
//! the job ledger honest.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::classifier::classify;
use crate::error::Result;
use crate::traits::{
    CrawlStateStore, CrawlStore, JobLedger, ListingParser, ListingStore, PageFetcher,
    RateLimitEventSink, SiteConfigStore,
};
use crate::types::{
    CrawlJob, CrawlMode, CrawlStateEntry, ExtractedListing, RateLimitEvent, Reconciliation,
    SiteConfig, SiteStatus,
};

/// Incremental crawls only look at the first few pages, where new
/// listings surface; content hashing handles the rest.
pub const INCREMENTAL_PAGE_CAP: u32 = 10;

/// Consecutive transport errors before a job circuit-breaks. Any
/// successful fetch resets the count.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Page to start the next full crawl from.
///
/// Three-tier fallback: the last completed job gives a precise resume
/// point; a bare downstream record count only an estimate; otherwise
/// start at page 1.
pub async fn resume_page(
    site: &SiteConfig,
    ledger: &dyn CrawlStore,
    listings: &dyn ListingStore,
) -> Result<u32> {
    if let Some(job) = ledger.last_completed_job(&site.domain).await? {
        return Ok(job.counters.pages_crawled + 1);
    }

    let records = listings.count_for_site(&site.domain).await?;
    if records > 0 && site.pagination.items_per_page > 0 {
        return Ok(records as u32 / site.pagination.items_per_page + 1);
    }

    Ok(1)
}

enum LoopOutcome {
    Completed,
    CircuitBroken,
}

/// Drives one site's crawl from job creation to a terminal state.
pub struct SiteCrawlWorker {
    store: Arc<dyn CrawlStore>,
    listings: Arc<dyn ListingStore>,
    fetcher: Arc<dyn PageFetcher>,
    parser: Arc<dyn ListingParser>,
}

impl SiteCrawlWorker {
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
        }
    }

    /// Run one crawl job to a terminal state. The returned job is
    /// always Completed or Failed, and its counters reflect true
    /// progress so the next job resumes correctly.
    pub async fn run(&self, site: &SiteConfig, mode: CrawlMode) -> Result<CrawlJob> {
        let mut job = CrawlJob::start(&site.domain, mode);
        self.store.create_job(&job).await?;
        info!(
            site = %site.domain,
            job_id = %job.id.0,
            mode = mode.as_str(),
            "Starting crawl job"
        );

        match self.crawl_loop(site, mode, &mut job).await {
            Ok(LoopOutcome::Completed) => {
                job.complete();
                self.store
                    .mark_crawled(&site.domain, mode, chrono::Utc::now())
                    .await?;
            }
            Ok(LoopOutcome::CircuitBroken) => {
                job.fail(format!("{MAX_CONSECUTIVE_ERRORS} consecutive fetch errors"));
                self.store
                    .update_status(&site.domain, SiteStatus::Failed)
                    .await?;
            }
            Err(e) => {
                warn!(site = %site.domain, error = %e, "Crawl job failed");
                job.fail(e.to_string());
                self.store
                    .update_status(&site.domain, SiteStatus::Failed)
                    .await?;
            }
        }

        self.store.finish_job(&job).await?;
        info!(
            site = %site.domain,
            job_id = %job.id.0,
            status = job.status.as_str(),
            pages = job.counters.pages_crawled,
            found = job.counters.listings_found,
            new = job.counters.listings_new,
            updated = job.counters.listings_updated,
            errors = job.counters.errors,
            "Crawl job finished"
        );
        Ok(job)
    }

    async fn crawl_loop(
        &self,
        site: &SiteConfig,
        mode: CrawlMode,
        job: &mut CrawlJob,
    ) -> Result<LoopOutcome> {
        let pages_needed = match mode {
            CrawlMode::Full => site.pagination.max_pages,
            CrawlMode::Incremental => site.pagination.max_pages.min(INCREMENTAL_PAGE_CAP),
        };
        let mut next_page = match mode {
            CrawlMode::Full => resume_page(site, self.store.as_ref(), self.listings.as_ref()).await?,
            CrawlMode::Incremental => 1,
        };

        let mut consecutive_errors = 0u32;
        let mut blocked_recently = false;

        while job.counters.pages_crawled < pages_needed {
            let remaining = pages_needed - job.counters.pages_crawled;
            let batch = remaining.min(site.max_workers.max(1) as u32);

            // Mandatory spacing before every fetch, doubled after a
            // blocked batch and back to normal once a batch comes
            // through clean. Bursts are impossible by construction;
            // this is not a token bucket.
            let spacing = if blocked_recently {
                site.rate_limit_secs * 2
            } else {
                site.rate_limit_secs
            };

            let fetches = (0..batch).map(|offset| {
                let url = site.pagination.page_url(&site.base_url, next_page + offset);
                let fetcher = Arc::clone(&self.fetcher);
                async move {
                    tokio::time::sleep(Duration::from_secs(spacing)).await;
                    let result = fetcher.fetch(&url).await;
                    (url, result)
                }
            });
            let results = join_all(fetches).await;
            next_page += batch;

            let mut batch_blocked = false;
            for (url, result) in results {
                job.counters.pages_crawled += 1;

                let page = match result {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(site = %site.domain, url = %url, error = %e, "Fetch failed");
                        job.counters.errors += 1;
                        consecutive_errors += 1;
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            return Ok(LoopOutcome::CircuitBroken);
                        }
                        continue;
                    }
                };
                consecutive_errors = 0;

                if let Some(reason) = classify(page.status, &page.body, &page.headers) {
                    warn!(
                        site = %site.domain,
                        url = %url,
                        reason = reason.as_str(),
                        status = page.status,
                        "Block detected, backing off"
                    );
                    self.store
                        .append(&RateLimitEvent::new(&site.domain, reason, &url))
                        .await?;
                    self.store
                        .update_status(&site.domain, SiteStatus::RateLimited)
                        .await?;
                    batch_blocked = true;
                    // A single blocked page slows the job, it does not
                    // abort it.
                    tokio::time::sleep(Duration::from_secs(site.rate_limit_secs * 2)).await;
                    continue;
                }

                match self.parser.parse(&page.body, &site.selectors) {
                    Ok(parsed) => {
                        for listing in parsed {
                            self.reconcile(site, listing, job).await?;
                        }
                    }
                    Err(e) => {
                        warn!(site = %site.domain, url = %url, error = %e, "Parse failed, page skipped");
                        job.counters.errors += 1;
                    }
                }
            }
            blocked_recently = batch_blocked;
        }

        Ok(LoopOutcome::Completed)
    }

    /// Classify one observed listing against crawl state and persist
    /// it downstream only when New or Updated.
    async fn reconcile(
        &self,
        site: &SiteConfig,
        listing: ExtractedListing,
        job: &mut CrawlJob,
    ) -> Result<()> {
        if listing.canonical_url.trim().is_empty() {
            warn!(site = %site.domain, "Listing without canonical URL, skipped");
            job.counters.errors += 1;
            return Ok(());
        }
        job.counters.listings_found += 1;

        let url_hash = listing.url_hash();
        let content_hash = listing.content_hash();
        let existing = self.store.lookup(&site.domain, &url_hash).await?;

        match Reconciliation::classify(existing.as_ref(), &content_hash) {
            Reconciliation::New => {
                let record_id = self.listings.save(&site.domain, &listing).await?;
                self.store
                    .upsert(&CrawlStateEntry::new(
                        &site.domain,
                        url_hash,
                        content_hash,
                        &record_id,
                    ))
                    .await?;
                job.counters.listings_new += 1;
                debug!(site = %site.domain, url = %listing.canonical_url, record_id = %record_id, "New listing");
            }
            Reconciliation::Updated { linked_id } => {
                self.listings.save(&site.domain, &listing).await?;
                self.store
                    .upsert(&CrawlStateEntry::new(
                        &site.domain,
                        url_hash,
                        content_hash,
                        &linked_id,
                    ))
                    .await?;
                job.counters.listings_updated += 1;
                debug!(site = %site.domain, url = %listing.canonical_url, record_id = %linked_id, "Listing changed");
            }
            Reconciliation::Unchanged { linked_id } => {
                // Refresh last_seen only; nothing goes downstream.
                self.store
                    .upsert(&CrawlStateEntry::new(
                        &site.domain,
                        url_hash,
                        content_hash,
                        &linked_id,
                    ))
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::stores::memory::{MemoryListingStore, MemoryStore};
    use crate::testing::{ScriptedFetcher, StaticJsonParser};
    use crate::traits::FetchedPage;
    use crate::types::{BlockReason, JobStatus, Pagination};
    use serde_json::json;

    fn test_site(max_pages: u32, max_workers: usize) -> SiteConfig {
        SiteConfig::new("example.com", "Example", "https://example.com")
            .with_pagination(Pagination {
                url_pattern: "listings?page={page}".to_string(),
                max_pages,
                items_per_page: 24,
            })
            .with_rate_limit(0)
            .with_max_workers(max_workers)
    }

    fn listing_page(listings: &[(&str, u32)]) -> FetchedPage {
        let items: Vec<_> = listings
            .iter()
            .map(|(url, price)| {
                json!({
                    "canonical_url": url,
                    "fields": {"title": format!("listing at {url}"), "price": price}
                })
            })
            .collect();
        // Pad the body past the near-empty threshold so the
        // classifier sees real content.
        let padding = " ".repeat(2000);
        FetchedPage::ok(format!("{}{padding}", json!(items)))
    }

    fn empty_page() -> FetchedPage {
        let padding = " ".repeat(2000);
        FetchedPage::ok(format!("[]{padding}"))
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        listings: Arc<MemoryListingStore>,
        fetcher: Arc<ScriptedFetcher>,
    }

    impl Fixture {
        fn new(fetcher: ScriptedFetcher) -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                listings: Arc::new(MemoryListingStore::new()),
                fetcher: Arc::new(fetcher),
            }
        }

        fn worker(&self) -> SiteCrawlWorker {
            SiteCrawlWorker::new(
                Arc::clone(&self.store) as Arc<dyn CrawlStore>,
                Arc::clone(&self.listings) as Arc<dyn ListingStore>,
                Arc::clone(&self.fetcher) as Arc<dyn PageFetcher>,
                Arc::new(StaticJsonParser),
            )
        }
    }

    async fn seed_site(fixture: &Fixture, site: &SiteConfig) {
        fixture.store.upsert_site(site).await.unwrap();
    }

    #[tokio::test]
    async fn completed_crawl_persists_new_listings() {
        let fetcher = ScriptedFetcher::default_response(listing_page(&[
            ("https://example.com/l/1", 100),
            ("https://example.com/l/2", 200),
        ]));
        let fixture = Fixture::new(fetcher);
        let site = test_site(2, 1);
        seed_site(&fixture, &site).await;

        let job = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counters.pages_crawled, 2);
        // Two listings per page but deduped by URL across pages.
        assert_eq!(job.counters.listings_new, 2);
        assert_eq!(fixture.listings.len(), 2);
    }

    #[tokio::test]
    async fn repeat_crawl_of_identical_content_is_idempotent() {
        let fetcher =
            ScriptedFetcher::default_response(listing_page(&[("https://example.com/l/1", 100)]));
        let fixture = Fixture::new(fetcher);
        let site = test_site(1, 1);
        seed_site(&fixture, &site).await;

        let first = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();
        assert_eq!(first.counters.listings_new, 1);

        let second = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();
        assert_eq!(second.counters.listings_new, 0);
        assert_eq!(second.counters.listings_updated, 0);
        assert_eq!(second.counters.listings_found, 1);
        assert_eq!(fixture.listings.len(), 1);
    }

    #[tokio::test]
    async fn changed_content_counts_as_updated() {
        let fetcher =
            ScriptedFetcher::default_response(listing_page(&[("https://example.com/l/1", 100)]));
        let fixture = Fixture::new(fetcher);
        let site = test_site(1, 1);
        seed_site(&fixture, &site).await;

        fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();

        // Price drop on the same canonical URL.
        fixture
            .fetcher
            .set_default(listing_page(&[("https://example.com/l/1", 90)]));
        let job = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();

        assert_eq!(job.counters.listings_new, 0);
        assert_eq!(job.counters.listings_updated, 1);
    }

    #[tokio::test]
    async fn circuit_breaks_after_five_consecutive_errors() {
        let fetcher = ScriptedFetcher::new();
        for page in 1..=20 {
            fetcher.push_error(
                format!("https://example.com/listings?page={page}"),
                "connection reset",
            );
        }
        let fixture = Fixture::new(fetcher);
        let site = test_site(20, 1);
        seed_site(&fixture, &site).await;

        let job = fixture
            .worker()
            .run(&site, CrawlMode::Full)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.counters.pages_crawled, 5);
        assert_eq!(job.counters.errors, 5);
        let stored = fixture.store.get_site("example.com").await.unwrap().unwrap();
        assert_eq!(stored.status, SiteStatus::Failed);
    }

    #[tokio::test]
    async fn a_success_resets_the_error_streak() {
        let fetcher = ScriptedFetcher::default_response(empty_page());
        for page in 1..=4 {
            fetcher.push_error(
                format!("https://example.com/listings?page={page}"),
                "connection reset",
            );
        }
        // Page 5 succeeds, then pages 6-9 fail again: neither streak
        // reaches five, so the job completes.
        for page in 6..=9 {
            fetcher.push_error(
                format!("https://example.com/listings?page={page}"),
                "connection reset",
            );
        }
        let fixture = Fixture::new(fetcher);
        let site = test_site(10, 1);
        seed_site(&fixture, &site).await;

        let job = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counters.pages_crawled, 10);
        assert_eq!(job.counters.errors, 8);
    }

    #[tokio::test]
    async fn blocked_page_logs_event_and_flips_status_without_aborting() {
        let fetcher = ScriptedFetcher::default_response(empty_page());
        fetcher.push_response(
            "https://example.com/listings?page=1",
            FetchedPage::ok("forbidden").with_status(403),
        );
        let fixture = Fixture::new(fetcher);
        let site = test_site(3, 1);
        seed_site(&fixture, &site).await;

        let job = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counters.pages_crawled, 3);
        assert_eq!(job.counters.listings_new, 0);

        let events = fixture.store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, BlockReason::IpBlock);
        assert_eq!(events[0].url, "https://example.com/listings?page=1");

        let stored = fixture.store.get_site("example.com").await.unwrap().unwrap();
        assert_eq!(stored.status, SiteStatus::RateLimited);
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_doubles_after_a_block_and_resets_after_a_clean_batch() {
        let fetcher = ScriptedFetcher::default_response(empty_page());
        fetcher.push_response(
            "https://example.com/listings?page=1",
            FetchedPage::ok("forbidden").with_status(403),
        );
        let fixture = Fixture::new(fetcher);
        let site = test_site(3, 1).with_rate_limit(1);
        seed_site(&fixture, &site).await;

        let started = tokio::time::Instant::now();
        let job = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        // 1s spacing before the blocked page, 2s backoff, 2s doubled
        // spacing before page 2, then back to 1s for page 3 once the
        // batch came through clean.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn incremental_mode_caps_pages_at_ten() {
        let fetcher = ScriptedFetcher::default_response(empty_page());
        let fixture = Fixture::new(fetcher);
        let site = test_site(500, 4);
        seed_site(&fixture, &site).await;

        let job = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counters.pages_crawled, 10);
        assert_eq!(fixture.fetcher.request_count(), 10);
    }

    #[tokio::test]
    async fn full_mode_resumes_after_a_completed_job() {
        let fetcher = ScriptedFetcher::default_response(empty_page());
        let fixture = Fixture::new(fetcher);
        let site = test_site(50, 1);
        seed_site(&fixture, &site).await;

        let mut prior = CrawlJob::start("example.com", CrawlMode::Full);
        prior.counters.pages_crawled = 42;
        prior.complete();
        fixture.store.create_job(&prior).await.unwrap();
        fixture.store.finish_job(&prior).await.unwrap();

        let got = resume_page(&site, fixture.store.as_ref(), fixture.listings.as_ref())
            .await
            .unwrap();
        assert_eq!(got, 43);
    }

    #[tokio::test]
    async fn resume_estimates_from_downstream_count_without_a_job() {
        let fetcher = ScriptedFetcher::default_response(empty_page());
        let fixture = Fixture::new(fetcher);
        let site = test_site(50, 1);

        // 120 records at 24 per page puts the crawl on page 6.
        for i in 0..120 {
            fixture
                .listings
                .save(
                    "example.com",
                    &ExtractedListing::new(
                        format!("https://example.com/l/{i}"),
                        json!({"title": i}),
                    ),
                )
                .await
                .unwrap();
        }

        let got = resume_page(&site, fixture.store.as_ref(), fixture.listings.as_ref())
            .await
            .unwrap();
        assert_eq!(got, 6);
    }

    #[tokio::test]
    async fn resume_defaults_to_page_one() {
        let fetcher = ScriptedFetcher::default_response(empty_page());
        let fixture = Fixture::new(fetcher);
        let site = test_site(50, 1);

        let got = resume_page(&site, fixture.store.as_ref(), fixture.listings.as_ref())
            .await
            .unwrap();
        assert_eq!(got, 1);
    }

    #[tokio::test]
    async fn unparseable_page_is_skipped_not_fatal() {
        let fetcher = ScriptedFetcher::new();
        let padding = " ".repeat(2000);
        fetcher.push_response(
            "https://example.com/listings?page=1",
            FetchedPage::ok(format!("<html>not json</html>{padding}")),
        );
        fetcher.push_response(
            "https://example.com/listings?page=2",
            listing_page(&[("https://example.com/l/1", 100)]),
        );
        let fixture = Fixture::new(fetcher);
        let site = test_site(2, 1);
        seed_site(&fixture, &site).await;

        let job = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counters.errors, 1);
        assert_eq!(job.counters.listings_new, 1);
    }

    #[tokio::test]
    async fn listing_without_canonical_url_is_skipped() {
        let padding = " ".repeat(2000);
        let body = format!(
            "{}{padding}",
            json!([
                {"canonical_url": "", "fields": {"title": "no url"}},
                {"canonical_url": "https://example.com/l/1", "fields": {"title": "ok"}}
            ])
        );
        let fetcher = ScriptedFetcher::default_response(FetchedPage::ok(body));
        let fixture = Fixture::new(fetcher);
        let site = test_site(1, 1);
        seed_site(&fixture, &site).await;

        let job = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();

        assert_eq!(job.counters.listings_found, 1);
        assert_eq!(job.counters.listings_new, 1);
        assert_eq!(job.counters.errors, 1);
    }

    #[tokio::test]
    async fn every_job_leaves_the_ledger_in_a_terminal_state() {
        let fetcher = ScriptedFetcher::new();
        for page in 1..=5 {
            fetcher.push_error(
                format!("https://example.com/listings?page={page}"),
                "dns failure",
            );
        }
        let fixture = Fixture::new(fetcher);
        let site = test_site(5, 1);
        seed_site(&fixture, &site).await;

        let job = fixture
            .worker()
            .run(&site, CrawlMode::Incremental)
            .await
            .unwrap();
        assert_ne!(job.status, JobStatus::Running);

        let recorded = fixture.store.recent_jobs("example.com", 10).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_ne!(recorded[0].status, JobStatus::Running);
        assert_eq!(recorded[0].counters, job.counters);
    }

    #[tokio::test]
    async fn transport_error_is_typed_as_such() {
        let err = EngineError::Fetch {
            url: "https://example.com".to_string(),
            message: "timeout".to_string(),
        };
        assert!(err.is_transport());
        assert!(!EngineError::Parse("bad".to_string()).is_transport());
    }
}
