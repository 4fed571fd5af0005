use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash of a listing's canonical URL, the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UrlHash(pub String);

impl UrlHash {
    pub fn of(canonical_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_url.trim().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hash of a listing's mutable fields, the change key.
///
/// Detects edits (price drops, title changes) independent of the
/// listing's URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Hash a normalized rendering of the field bag so key order and
    /// incidental whitespace never register as a change.
    pub fn of_fields(fields: &serde_json::Value) -> Self {
        let normalized = normalize_json(fields);
        let json = serde_json::to_string(&normalized).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Normalize JSON for consistent hashing: trim and lowercase strings,
/// recurse into containers. `serde_json::Map` preserves insertion
/// order, so objects are rebuilt with sorted keys.
fn normalize_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(s.trim().to_lowercase()),
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut normalized = serde_json::Map::new();
            for k in keys {
                normalized.insert(k.clone(), normalize_json(&map[k]));
            }
            serde_json::Value::Object(normalized)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(normalize_json).collect())
        }
        other => other.clone(),
    }
}

/// Durable record of one observed listing URL on one site.
///
/// Unique per `(site, url_hash)`; re-observation refreshes
/// `last_seen`, and a differing content hash marks an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlStateEntry {
    pub site: String,
    pub url_hash: UrlHash,
    pub content_hash: ContentHash,
    /// Id of the downstream record this URL maps to.
    pub linked_id: String,
    pub last_seen: DateTime<Utc>,
}

impl CrawlStateEntry {
    pub fn new(
        site: impl Into<String>,
        url_hash: UrlHash,
        content_hash: ContentHash,
        linked_id: impl Into<String>,
    ) -> Self {
        Self {
            site: site.into(),
            url_hash,
            content_hash,
            linked_id: linked_id.into(),
            last_seen: Utc::now(),
        }
    }
}

/// Outcome of reconciling an observed listing against crawl state.
///
/// Nothing goes downstream unless `New` or `Updated`, which bounds
/// write amplification regardless of re-crawl frequency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    New,
    Unchanged { linked_id: String },
    Updated { linked_id: String },
}

impl Reconciliation {
    pub fn classify(existing: Option<&CrawlStateEntry>, observed: &ContentHash) -> Self {
        match existing {
            None => Self::New,
            Some(entry) if entry.content_hash == *observed => Self::Unchanged {
                linked_id: entry.linked_id.clone(),
            },
            Some(entry) => Self::Updated {
                linked_id: entry.linked_id.clone(),
            },
        }
    }
}
