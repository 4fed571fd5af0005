//! SQLite storage implementation.
//!
//! File-based backend for the four engine-owned collections plus a
//! plain `listings` table serving as the downstream store for
//! single-process deployments. Timestamps are stored as RFC 3339
//! TEXT; opaque JSON blobs as serialized TEXT.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::traits::{
    CrawlStateStore, JobLedger, ListingStore, RateLimitEventSink, SiteConfigStore,
};
use crate::types::{
    BlockReason, CrawlJob, CrawlMode, CrawlStateEntry, ExtractedListing, JobCounters, JobId,
    JobStatus, Pagination, RateLimitEvent, SiteConfig, SiteStatus, UrlHash,
};

/// SQLite-backed crawl store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and run migrations.
    ///
    /// # Example URLs
    /// - `sqlite://crawl.db?mode=rwc` - file, created if missing
    /// - `sqlite::memory:` - ephemeral, for tests
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory store for testing. A single connection, since each
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS site_configs (
                domain TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                selectors TEXT NOT NULL DEFAULT 'null',
                url_pattern TEXT NOT NULL,
                max_pages INTEGER NOT NULL,
                items_per_page INTEGER NOT NULL,
                rate_limit_secs INTEGER NOT NULL,
                max_workers INTEGER NOT NULL,
                crawl_cadence_hours INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'active',
                notes TEXT,
                last_full_crawl TEXT,
                last_incremental_crawl TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crawl_jobs (
                id TEXT PRIMARY KEY,
                site TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                pages_crawled INTEGER NOT NULL DEFAULT 0,
                listings_found INTEGER NOT NULL DEFAULT 0,
                listings_new INTEGER NOT NULL DEFAULT 0,
                listings_updated INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_crawl_jobs_site ON crawl_jobs(site, started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crawl_state (
                site TEXT NOT NULL,
                url_hash TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                linked_id TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (site, url_hash)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site TEXT NOT NULL,
                reason TEXT NOT NULL,
                url TEXT NOT NULL,
                detected_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rate_limit_events_site ON rate_limit_events(site);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id TEXT PRIMARY KEY,
                site TEXT NOT NULL,
                canonical_url TEXT NOT NULL,
                fields TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (site, canonical_url)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(EngineError::storage)
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_reason(s: &str) -> Result<BlockReason> {
    match s {
        "http_429" => Ok(BlockReason::Http429),
        "ip_block" => Ok(BlockReason::IpBlock),
        "captcha" => Ok(BlockReason::Captcha),
        "bot_challenge" => Ok(BlockReason::BotChallenge),
        other => Err(EngineError::Config {
            reason: format!("unknown block reason: {other}"),
        }),
    }
}

fn site_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SiteConfig> {
    let selectors: String = row.get("selectors");
    Ok(SiteConfig {
        domain: row.get("domain"),
        name: row.get("name"),
        base_url: row.get("base_url"),
        selectors: serde_json::from_str(&selectors).map_err(EngineError::storage)?,
        pagination: Pagination {
            url_pattern: row.get("url_pattern"),
            max_pages: row.get::<i64, _>("max_pages") as u32,
            items_per_page: row.get::<i64, _>("items_per_page") as u32,
        },
        rate_limit_secs: row.get::<i64, _>("rate_limit_secs") as u64,
        max_workers: row.get::<i64, _>("max_workers") as usize,
        crawl_cadence_hours: row.get::<i64, _>("crawl_cadence_hours") as u32,
        enabled: row.get::<i64, _>("enabled") != 0,
        status: SiteStatus::parse(row.get::<String, _>("status").as_str())?,
        notes: row.get("notes"),
        last_full_crawl: parse_opt_ts(row.get("last_full_crawl"))?,
        last_incremental_crawl: parse_opt_ts(row.get("last_incremental_crawl"))?,
    })
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CrawlJob> {
    let id: String = row.get("id");
    let started_at: String = row.get("started_at");
    Ok(CrawlJob {
        id: JobId(Uuid::parse_str(&id).map_err(EngineError::storage)?),
        site: row.get("site"),
        mode: CrawlMode::parse(row.get::<String, _>("mode").as_str())?,
        status: JobStatus::parse(row.get::<String, _>("status").as_str())?,
        counters: JobCounters {
            pages_crawled: row.get::<i64, _>("pages_crawled") as u32,
            listings_found: row.get::<i64, _>("listings_found") as u32,
            listings_new: row.get::<i64, _>("listings_new") as u32,
            listings_updated: row.get::<i64, _>("listings_updated") as u32,
            errors: row.get::<i64, _>("errors") as u32,
        },
        started_at: parse_ts(&started_at)?,
        finished_at: parse_opt_ts(row.get("finished_at"))?,
        error: row.get("error"),
    })
}

#[async_trait]
impl SiteConfigStore for SqliteStore {
    async fn get_site(&self, domain: &str) -> Result<Option<SiteConfig>> {
        let row = sqlx::query("SELECT * FROM site_configs WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(site_from_row).transpose()
    }

    async fn list_sites(&self) -> Result<Vec<SiteConfig>> {
        let rows = sqlx::query("SELECT * FROM site_configs ORDER BY domain")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(site_from_row).collect()
    }

    async fn upsert_site(&self, site: &SiteConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO site_configs (
                domain, name, base_url, selectors, url_pattern, max_pages,
                items_per_page, rate_limit_secs, max_workers, crawl_cadence_hours,
                enabled, status, notes, last_full_crawl, last_incremental_crawl
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (domain) DO UPDATE SET
                name = excluded.name,
                base_url = excluded.base_url,
                selectors = excluded.selectors,
                url_pattern = excluded.url_pattern,
                max_pages = excluded.max_pages,
                items_per_page = excluded.items_per_page,
                rate_limit_secs = excluded.rate_limit_secs,
                max_workers = excluded.max_workers,
                crawl_cadence_hours = excluded.crawl_cadence_hours,
                enabled = excluded.enabled,
                status = excluded.status,
                notes = excluded.notes,
                last_full_crawl = excluded.last_full_crawl,
                last_incremental_crawl = excluded.last_incremental_crawl
            "#,
        )
        .bind(&site.domain)
        .bind(&site.name)
        .bind(&site.base_url)
        .bind(serde_json::to_string(&site.selectors).map_err(EngineError::storage)?)
        .bind(&site.pagination.url_pattern)
        .bind(site.pagination.max_pages as i64)
        .bind(site.pagination.items_per_page as i64)
        .bind(site.rate_limit_secs as i64)
        .bind(site.max_workers as i64)
        .bind(site.crawl_cadence_hours as i64)
        .bind(site.enabled as i64)
        .bind(site.status.as_str())
        .bind(&site.notes)
        .bind(site.last_full_crawl.map(|dt| dt.to_rfc3339()))
        .bind(site.last_incremental_crawl.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(&self, domain: &str, status: SiteStatus) -> Result<()> {
        sqlx::query("UPDATE site_configs SET status = ? WHERE domain = ?")
            .bind(status.as_str())
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_enabled(&self, domain: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE site_configs SET enabled = ? WHERE domain = ?")
            .bind(enabled as i64)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_crawled(&self, domain: &str, mode: CrawlMode, at: DateTime<Utc>) -> Result<()> {
        let column = match mode {
            CrawlMode::Full => "last_full_crawl",
            CrawlMode::Incremental => "last_incremental_crawl",
        };
        let sql = format!("UPDATE site_configs SET {column} = ? WHERE domain = ?");
        sqlx::query(&sql)
            .bind(at.to_rfc3339())
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobLedger for SqliteStore {
    async fn create_job(&self, job: &CrawlJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawl_jobs (
                id, site, mode, status, pages_crawled, listings_found,
                listings_new, listings_updated, errors, started_at, finished_at, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.0.to_string())
        .bind(&job.site)
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(job.counters.pages_crawled as i64)
        .bind(job.counters.listings_found as i64)
        .bind(job.counters.listings_new as i64)
        .bind(job.counters.listings_updated as i64)
        .bind(job.counters.errors as i64)
        .bind(job.started_at.to_rfc3339())
        .bind(job.finished_at.map(|dt| dt.to_rfc3339()))
        .bind(&job.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_job(&self, job: &CrawlJob) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs SET
                status = ?, pages_crawled = ?, listings_found = ?,
                listings_new = ?, listings_updated = ?, errors = ?,
                finished_at = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.counters.pages_crawled as i64)
        .bind(job.counters.listings_found as i64)
        .bind(job.counters.listings_new as i64)
        .bind(job.counters.listings_updated as i64)
        .bind(job.counters.errors as i64)
        .bind(job.finished_at.map(|dt| dt.to_rfc3339()))
        .bind(&job.error)
        .bind(job.id.0.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_completed_job(&self, site: &str) -> Result<Option<CrawlJob>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM crawl_jobs
            WHERE site = ? AND status = 'completed'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(site)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn recent_jobs(&self, site: &str, limit: usize) -> Result<Vec<CrawlJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM crawl_jobs
            WHERE site = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(site)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl CrawlStateStore for SqliteStore {
    async fn lookup(&self, site: &str, url_hash: &UrlHash) -> Result<Option<CrawlStateEntry>> {
        let row = sqlx::query(
            "SELECT * FROM crawl_state WHERE site = ? AND url_hash = ?",
        )
        .bind(site)
        .bind(url_hash.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let last_seen: String = r.get("last_seen");
            Ok(CrawlStateEntry {
                site: r.get("site"),
                url_hash: UrlHash(r.get("url_hash")),
                content_hash: crate::types::ContentHash(r.get("content_hash")),
                linked_id: r.get("linked_id"),
                last_seen: parse_ts(&last_seen)?,
            })
        })
        .transpose()
    }

    async fn upsert(&self, entry: &CrawlStateEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawl_state (site, url_hash, content_hash, linked_id, last_seen)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (site, url_hash) DO UPDATE SET
                content_hash = excluded.content_hash,
                linked_id = excluded.linked_id,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(&entry.site)
        .bind(entry.url_hash.as_str())
        .bind(entry.content_hash.as_str())
        .bind(&entry.linked_id)
        .bind(entry.last_seen.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_entries(&self, site: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM crawl_state WHERE site = ?")
            .bind(site)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[async_trait]
impl RateLimitEventSink for SqliteStore {
    async fn append(&self, event: &RateLimitEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_limit_events (site, reason, url, detected_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.site)
        .bind(event.reason.as_str())
        .bind(&event.url)
        .bind(event.detected_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl SqliteStore {
    /// Recent rate-limit events for a site, newest first. Diagnostic
    /// surface for the CLI; the engine never reads these back.
    pub async fn recent_events(&self, site: &str, limit: usize) -> Result<Vec<RateLimitEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT site, reason, url, detected_at FROM rate_limit_events
            WHERE site = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(site)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let detected_at: String = r.get("detected_at");
                Ok(RateLimitEvent {
                    site: r.get("site"),
                    reason: parse_reason(r.get::<String, _>("reason").as_str())?,
                    url: r.get("url"),
                    detected_at: parse_ts(&detected_at)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ListingStore for SqliteStore {
    async fn save(&self, site: &str, listing: &ExtractedListing) -> Result<String> {
        let existing: Option<String> =
            sqlx::query("SELECT id FROM listings WHERE site = ? AND canonical_url = ?")
                .bind(site)
                .bind(&listing.canonical_url)
                .fetch_optional(&self.pool)
                .await?
                .map(|r| r.get("id"));

        let fields = serde_json::to_string(&listing.fields).map_err(EngineError::storage)?;
        match existing {
            Some(id) => {
                sqlx::query("UPDATE listings SET fields = ?, updated_at = ? WHERE id = ?")
                    .bind(&fields)
                    .bind(Utc::now().to_rfc3339())
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                Ok(id)
            }
            None => {
                let id = Uuid::now_v7().to_string();
                sqlx::query(
                    "INSERT INTO listings (id, site, canonical_url, fields, updated_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(site)
                .bind(&listing.canonical_url)
                .bind(&fields)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
                Ok(id)
            }
        }
    }

    async fn count_for_site(&self, site: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM listings WHERE site = ?")
            .bind(site)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentHash;
    use serde_json::json;

    #[tokio::test]
    async fn site_config_round_trips() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut site = SiteConfig::new("example.com", "Example", "https://example.com")
            .with_selectors(json!({"item": ".listing"}));
        site.notes = Some("watch the rate limit".to_string());
        store.upsert_site(&site).await.unwrap();

        let loaded = store.get_site("example.com").await.unwrap().unwrap();
        assert_eq!(loaded.domain, site.domain);
        assert_eq!(loaded.selectors, site.selectors);
        assert_eq!(loaded.status, SiteStatus::Active);
        assert_eq!(loaded.notes.as_deref(), Some("watch the rate limit"));

        store
            .update_status("example.com", SiteStatus::RateLimited)
            .await
            .unwrap();
        store.set_enabled("example.com", false).await.unwrap();
        let loaded = store.get_site("example.com").await.unwrap().unwrap();
        assert_eq!(loaded.status, SiteStatus::RateLimited);
        assert!(!loaded.enabled);
    }

    #[tokio::test]
    async fn job_ledger_tracks_completion() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut job = CrawlJob::start("example.com", CrawlMode::Full);
        store.create_job(&job).await.unwrap();

        assert!(store.last_completed_job("example.com").await.unwrap().is_none());

        job.counters.pages_crawled = 42;
        job.complete();
        store.finish_job(&job).await.unwrap();

        let loaded = store.last_completed_job("example.com").await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.counters.pages_crawled, 42);
        assert_eq!(loaded.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn crawl_state_upsert_replaces_hash() {
        let store = SqliteStore::in_memory().await.unwrap();
        let url_hash = UrlHash::of("https://example.com/l/1");

        let entry = CrawlStateEntry::new(
            "example.com",
            url_hash.clone(),
            ContentHash::of_fields(&json!({"price": 100})),
            "rec-1",
        );
        store.upsert(&entry).await.unwrap();

        let changed = CrawlStateEntry::new(
            "example.com",
            url_hash.clone(),
            ContentHash::of_fields(&json!({"price": 90})),
            "rec-1",
        );
        store.upsert(&changed).await.unwrap();

        let loaded = store.lookup("example.com", &url_hash).await.unwrap().unwrap();
        assert_eq!(loaded.content_hash, changed.content_hash);
        assert_eq!(store.count_entries("example.com").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn listings_keep_a_stable_record_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let listing = ExtractedListing::new("https://example.com/l/1", json!({"price": 100}));

        let id1 = store.save("example.com", &listing).await.unwrap();
        let updated = ExtractedListing::new("https://example.com/l/1", json!({"price": 90}));
        let id2 = store.save("example.com", &updated).await.unwrap();

        assert_eq!(id1, id2);
        assert_eq!(store.count_for_site("example.com").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rate_limit_events_append_only() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .append(&RateLimitEvent::new(
                "example.com",
                BlockReason::Http429,
                "https://example.com/p/1",
            ))
            .await
            .unwrap();
        store
            .append(&RateLimitEvent::new(
                "example.com",
                BlockReason::Captcha,
                "https://example.com/p/2",
            ))
            .await
            .unwrap();

        let events = store.recent_events("example.com", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, BlockReason::Captcha);
        assert_eq!(events[1].reason, BlockReason::Http429);
    }
}
