//! In-memory storage implementation for testing and development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::traits::{
    CrawlStateStore, JobLedger, ListingStore, RateLimitEventSink, SiteConfigStore,
};
use crate::types::{
    CrawlJob, CrawlMode, CrawlStateEntry, ExtractedListing, JobStatus, RateLimitEvent, SiteConfig,
    SiteStatus, UrlHash,
};

/// In-memory crawl store. Data is lost on restart; useful for tests
/// and local development only.
pub struct MemoryStore {
    sites: RwLock<HashMap<String, SiteConfig>>,
    jobs: RwLock<Vec<CrawlJob>>,
    state: RwLock<HashMap<(String, String), CrawlStateEntry>>,
    events: RwLock<Vec<RateLimitEvent>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sites: RwLock::new(HashMap::new()),
            jobs: RwLock::new(Vec::new()),
            state: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the appended rate-limit events.
    pub fn events(&self) -> Vec<RateLimitEvent> {
        self.events.read().unwrap().clone()
    }

    /// Number of crawl-state entries across all sites.
    pub fn state_len(&self) -> usize {
        self.state.read().unwrap().len()
    }
}

#[async_trait]
impl SiteConfigStore for MemoryStore {
    async fn get_site(&self, domain: &str) -> Result<Option<SiteConfig>> {
        Ok(self.sites.read().unwrap().get(domain).cloned())
    }

    async fn list_sites(&self) -> Result<Vec<SiteConfig>> {
        let mut sites: Vec<_> = self.sites.read().unwrap().values().cloned().collect();
        sites.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(sites)
    }

    async fn upsert_site(&self, site: &SiteConfig) -> Result<()> {
        self.sites
            .write()
            .unwrap()
            .insert(site.domain.clone(), site.clone());
        Ok(())
    }

    async fn update_status(&self, domain: &str, status: SiteStatus) -> Result<()> {
        if let Some(site) = self.sites.write().unwrap().get_mut(domain) {
            site.status = status;
        }
        Ok(())
    }

    async fn set_enabled(&self, domain: &str, enabled: bool) -> Result<()> {
        if let Some(site) = self.sites.write().unwrap().get_mut(domain) {
            site.enabled = enabled;
        }
        Ok(())
    }

    async fn mark_crawled(&self, domain: &str, mode: CrawlMode, at: DateTime<Utc>) -> Result<()> {
        if let Some(site) = self.sites.write().unwrap().get_mut(domain) {
            match mode {
                CrawlMode::Full => site.last_full_crawl = Some(at),
                CrawlMode::Incremental => site.last_incremental_crawl = Some(at),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobLedger for MemoryStore {
    async fn create_job(&self, job: &CrawlJob) -> Result<()> {
        self.jobs.write().unwrap().push(job.clone());
        Ok(())
    }

    async fn finish_job(&self, job: &CrawlJob) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(existing) = jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job.clone();
        } else {
            jobs.push(job.clone());
        }
        Ok(())
    }

    async fn last_completed_job(&self, site: &str) -> Result<Option<CrawlJob>> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .iter()
            .filter(|j| j.site == site && j.status == JobStatus::Completed)
            .max_by_key(|j| j.started_at)
            .cloned())
    }

    async fn recent_jobs(&self, site: &str, limit: usize) -> Result<Vec<CrawlJob>> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .unwrap()
            .iter()
            .filter(|j| j.site == site)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.started_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[async_trait]
impl CrawlStateStore for MemoryStore {
    async fn lookup(&self, site: &str, url_hash: &UrlHash) -> Result<Option<CrawlStateEntry>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .get(&(site.to_string(), url_hash.0.clone()))
            .cloned())
    }

    async fn upsert(&self, entry: &CrawlStateEntry) -> Result<()> {
        self.state
            .write()
            .unwrap()
            .insert((entry.site.clone(), entry.url_hash.0.clone()), entry.clone());
        Ok(())
    }

    async fn count_entries(&self, site: &str) -> Result<u64> {
        Ok(self
            .state
            .read()
            .unwrap()
            .keys()
            .filter(|(s, _)| s == site)
            .count() as u64)
    }
}

#[async_trait]
impl RateLimitEventSink for MemoryStore {
    async fn append(&self, event: &RateLimitEvent) -> Result<()> {
        self.events.write().unwrap().push(event.clone());
        Ok(())
    }
}

/// In-memory downstream listing store.
pub struct MemoryListingStore {
    records: RwLock<HashMap<String, (String, ExtractedListing)>>,
    next_id: RwLock<u64>,
}

impl Default for MemoryListingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: RwLock::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn save(&self, site: &str, listing: &ExtractedListing) -> Result<String> {
        let key = format!("{site}:{}", listing.canonical_url);
        let mut records = self.records.write().unwrap();
        if let Some((id, existing)) = records.get_mut(&key) {
            let id = id.clone();
            *existing = listing.clone();
            return Ok(id);
        }
        let mut next = self.next_id.write().unwrap();
        *next += 1;
        let id = format!("rec-{}", *next);
        records.insert(key, (id.clone(), listing.clone()));
        Ok(id)
    }

    async fn count_for_site(&self, site: &str) -> Result<u64> {
        let prefix = format!("{site}:");
        Ok(self
            .records
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count() as u64)
    }
}
