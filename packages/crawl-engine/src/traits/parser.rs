use crate::error::Result;
use crate::types::ExtractedListing;

/// External HTML-to-listing parser.
///
/// `selectors` is the site's opaque selector blob, passed through
/// untouched; the engine never branches on its contents.
pub trait ListingParser: Send + Sync {
    fn parse(&self, body: &str, selectors: &serde_json::Value) -> Result<Vec<ExtractedListing>>;
}
