use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::state::{ContentHash, UrlHash};

/// A listing produced by the external parser.
///
/// The engine never interprets `fields`; it only hashes them for
/// change detection and hands the whole value to the downstream store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedListing {
    pub canonical_url: String,
    pub fields: serde_json::Value,
}

impl ExtractedListing {
    pub fn new(canonical_url: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            canonical_url: canonical_url.into(),
            fields,
        }
    }

    pub fn url_hash(&self) -> UrlHash {
        UrlHash::of(&self.canonical_url)
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of_fields(&self.fields)
    }
}

/// Why a fetched page was classified as blocked rather than content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    /// Explicit 429 Too Many Requests
    Http429,
    /// 403, near-empty body, or an access-denied page
    IpBlock,
    /// Captcha markup in the response
    Captcha,
    /// Anti-bot vendor challenge page (Cloudflare, DataDome, ...)
    BotChallenge,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http429 => "http_429",
            Self::IpBlock => "ip_block",
            Self::Captcha => "captcha",
            Self::BotChallenge => "bot_challenge",
        }
    }
}

/// Append-only diagnostic record of a detected block.
///
/// Written whenever the classifier fires; never read back by the
/// engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEvent {
    pub site: String,
    pub reason: BlockReason,
    pub url: String,
    pub detected_at: DateTime<Utc>,
}

impl RateLimitEvent {
    pub fn new(site: impl Into<String>, reason: BlockReason, url: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            reason,
            url: url.into(),
            detected_at: Utc::now(),
        }
    }
}
