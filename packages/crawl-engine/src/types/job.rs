use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Unique identifier for a crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// Crawl depth for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlMode {
    /// Cover the site's full estimated page range, resuming from the
    /// last completed job.
    Full,
    /// Re-crawl only the first few pages where new listings surface,
    /// relying on content hashing to skip unchanged items.
    Incremental,
}

impl CrawlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(EngineError::Config {
                reason: format!("unknown crawl mode: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(EngineError::Config {
                reason: format!("unknown job status: {other}"),
            }),
        }
    }
}

/// Progress counters accumulated over a job's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    /// Pages attempted, whether they yielded listings, errored, or
    /// came back blocked. This is the resume point for the next job.
    pub pages_crawled: u32,
    pub listings_found: u32,
    pub listings_new: u32,
    pub listings_updated: u32,
    pub errors: u32,
}

/// One crawl of one site. Created when the worker starts and
/// finalized exactly once; never left `Running` after the worker
/// returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: JobId,
    pub site: String,
    pub mode: CrawlMode,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl CrawlJob {
    pub fn start(site: impl Into<String>, mode: CrawlMode) -> Self {
        Self {
            id: JobId::new(),
            site: site.into(),
            mode,
            status: JobStatus::Running,
            counters: JobCounters::default(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
