//! Operator CLI for the crawl engine.

mod fetch;
mod parse;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crawl_engine::{
    CrawlMode, CrawlStateStore, CrawlStore, CrawlSummary, JobLedger, ListingStore, Orchestrator,
    SiteConfig, SiteConfigStore, SiteStatus, SqliteStore, DEFAULT_GLOBAL_CONCURRENCY,
};
use tracing_subscriber::EnvFilter;

use crate::fetch::HttpFetcher;
use crate::parse::CssListingParser;

#[derive(Parser)]
#[command(name = "crawl", about = "Incremental multi-site listing crawler", version)]
struct Cli {
    /// SQLite database holding site configs, jobs, and crawl state
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://crawl.db?mode=rwc")]
    database_url: String,

    /// Maximum number of sites crawled concurrently
    #[arg(long, default_value_t = DEFAULT_GLOBAL_CONCURRENCY)]
    max_concurrent_sites: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl one site, or every eligible site that is due
    Crawl {
        /// Site domain; omit to crawl all eligible sites
        site: Option<String>,
        #[arg(value_enum, default_value_t = ModeArg::Incremental)]
        mode: ModeArg,
        /// Crawl sites even when their cadence says they are fresh
        #[arg(long)]
        force: bool,
    },
    /// Show per-site status, last crawls, and tracked URL counts
    Status,
    /// Re-enable a site and reset its status to active
    Enable { site: String },
    /// Soft-disable a site (configuration is kept)
    Disable { site: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Full,
    Incremental,
}

impl From<ModeArg> for CrawlMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => CrawlMode::Full,
            ModeArg::Incremental => CrawlMode::Incremental,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let store = Arc::new(
        SqliteStore::new(&cli.database_url)
            .await
            .context("failed to open database")?,
    );

    match cli.command {
        Command::Crawl { site, mode, force } => {
            let summary = run_crawl(&store, cli.max_concurrent_sites, site, mode.into(), force)
                .await?;
            report(&summary);
        }
        Command::Status => {
            print_status(&store).await?;
        }
        Command::Enable { site } => {
            require_site(&store, &site).await?;
            store.set_enabled(&site, true).await?;
            store.update_status(&site, SiteStatus::Active).await?;
            println!("enabled {site}");
        }
        Command::Disable { site } => {
            require_site(&store, &site).await?;
            store.set_enabled(&site, false).await?;
            store.update_status(&site, SiteStatus::Disabled).await?;
            println!("disabled {site}");
        }
    }

    Ok(())
}

async fn require_site(store: &SqliteStore, domain: &str) -> Result<SiteConfig> {
    match store.get_site(domain).await? {
        Some(site) => Ok(site),
        None => bail!("unknown site: {domain}"),
    }
}

async fn run_crawl(
    store: &Arc<SqliteStore>,
    max_concurrent_sites: usize,
    site: Option<String>,
    mode: CrawlMode,
    force: bool,
) -> Result<CrawlSummary> {
    let targets = match site {
        Some(domain) => {
            let site = require_site(store, &domain).await?;
            if let Some(notice) = disabled_notice(&site) {
                eprintln!("warning: {notice}");
            }
            vec![site]
        }
        None => {
            let now = chrono::Utc::now();
            store
                .eligible_sites()
                .await?
                .into_iter()
                .filter(|s| force || s.is_due(mode, now))
                .collect()
        }
    };

    if targets.is_empty() {
        println!("no sites due for crawling");
        return Ok(CrawlSummary::default());
    }

    let orchestrator = Orchestrator::new(
        Arc::clone(store) as Arc<dyn CrawlStore>,
        Arc::clone(store) as Arc<dyn ListingStore>,
        Arc::new(HttpFetcher::new()?),
        Arc::new(CssListingParser),
    )
    .with_global_concurrency(max_concurrent_sites);

    Ok(orchestrator.run_sites(targets, mode).await?)
}

/// Naming a site explicitly is the manual override path and runs it
/// regardless of status, but bypassing a soft-disable should be loud.
fn disabled_notice(site: &SiteConfig) -> Option<String> {
    if site.enabled {
        None
    } else {
        Some(format!(
            "{} is disabled; crawling it anyway because it was named explicitly",
            site.domain
        ))
    }
}

fn report(summary: &CrawlSummary) {
    for job in &summary.jobs {
        let duration = job
            .duration()
            .map(|d| format!("{}s", d.num_seconds()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<10} pages={} found={} new={} updated={} errors={} ({duration})",
            job.site,
            job.status.as_str(),
            job.counters.pages_crawled,
            job.counters.listings_found,
            job.counters.listings_new,
            job.counters.listings_updated,
            job.counters.errors,
        );
        if let Some(error) = &job.error {
            println!("{:<24} ^ {error}", "");
        }
    }
    println!(
        "done: {} succeeded, {} failed",
        summary.sites_succeeded, summary.sites_failed
    );
}

async fn print_status(store: &SqliteStore) -> Result<()> {
    let sites = store.list_sites().await?;
    if sites.is_empty() {
        println!("no sites configured");
        return Ok(());
    }

    println!(
        "{:<24} {:<12} {:<8} {:<8} {:<20} {:<20}",
        "site", "status", "enabled", "urls", "last full", "last incremental"
    );
    for site in sites {
        let tracked = store.count_entries(&site.domain).await?;
        println!(
            "{:<24} {:<12} {:<8} {:<8} {:<20} {:<20}",
            site.domain,
            site.status.as_str(),
            if site.enabled { "yes" } else { "no" },
            tracked,
            format_ts(site.last_full_crawl),
            format_ts(site.last_incremental_crawl),
        );
        if let Some(job) = store.recent_jobs(&site.domain, 1).await?.first() {
            println!(
                "{:<24} last job: {} {} new={} updated={} errors={}",
                "",
                job.mode.as_str(),
                job.status.as_str(),
                job.counters.listings_new,
                job.counters.listings_updated,
                job.counters.errors,
            );
        }
    }
    Ok(())
}

fn format_ts(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}
