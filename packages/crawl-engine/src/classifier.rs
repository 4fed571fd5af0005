//! Heuristic rate-limit / block detection.
//!
//! `classify` is a pure, total function over a fetched response. It
//! has to balance two failure modes with real operational cost: a
//! false negative keeps hammering a site that is already blocking us
//! (risking an IP ban), while a false positive throws away a real
//! page and slows the crawl for nothing.

use std::collections::HashMap;

use crate::types::BlockReason;

/// Bodies shorter than this are treated as block pages outright;
/// real listing pages are never this small.
pub const MIN_REAL_BODY_BYTES: usize = 1000;

/// Signature matches only count in bodies up to this size. Large real
/// pages routinely embed anti-bot vendor script tags without being
/// blocked; only small pages carrying a signature are challenges.
pub const SIGNATURE_BODY_CEILING: usize = 10_000;

/// Known block-page markers, lowercase. First match wins.
const BLOCK_SIGNATURES: &[(&str, BlockReason)] = &[
    ("captcha", BlockReason::Captcha),
    ("are you a robot", BlockReason::Captcha),
    ("cf-browser-verification", BlockReason::BotChallenge),
    ("checking your browser", BlockReason::BotChallenge),
    ("challenge-platform", BlockReason::BotChallenge),
    ("datadome", BlockReason::BotChallenge),
    ("access denied", BlockReason::IpBlock),
    ("unusual traffic", BlockReason::IpBlock),
];

/// Classify a fetched response. `None` means the page is real content.
pub fn classify(
    status: u16,
    body: &str,
    headers: &HashMap<String, String>,
) -> Option<BlockReason> {
    if status == 429 {
        return Some(BlockReason::Http429);
    }
    if status == 403 {
        return Some(BlockReason::IpBlock);
    }
    if body.len() < MIN_REAL_BODY_BYTES {
        return Some(BlockReason::IpBlock);
    }

    // The challenge header counts as a signature and sits under the
    // same ceiling: a content-rich page is real content no matter
    // what it was served with.
    if body.len() <= SIGNATURE_BODY_CEILING {
        if headers.keys().any(|k| k.eq_ignore_ascii_case("cf-mitigated")) {
            return Some(BlockReason::BotChallenge);
        }
        let lower = body.to_lowercase();
        for (signature, reason) in BLOCK_SIGNATURES {
            if lower.contains(signature) {
                return Some(*reason);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    /// A body that passes the minimum-size rule and carries no signature.
    fn real_body(len: usize) -> String {
        "listing page content ".repeat(len / 21 + 1)[..len].to_string()
    }

    #[test]
    fn status_429_wins_over_everything() {
        let classified = classify(429, &real_body(5000), &no_headers());
        assert_eq!(classified, Some(BlockReason::Http429));
    }

    #[test]
    fn status_403_is_an_ip_block() {
        assert_eq!(classify(403, &real_body(5000), &no_headers()), Some(BlockReason::IpBlock));
    }

    #[test]
    fn near_empty_bodies_are_blocks_regardless_of_content() {
        assert_eq!(classify(200, "", &no_headers()), Some(BlockReason::IpBlock));
        assert_eq!(classify(200, &real_body(999), &no_headers()), Some(BlockReason::IpBlock));
        assert_eq!(classify(200, &real_body(1000), &no_headers()), None);
    }

    #[test]
    fn signature_detected_in_small_bodies_only() {
        let small = format!("{}captcha{}", real_body(2000), real_body(2000));
        assert_eq!(classify(200, &small, &no_headers()), Some(BlockReason::Captcha));

        // The same signature in a content-rich page is not a block.
        let large = format!("{}captcha{}", real_body(9000), real_body(9000));
        assert!(large.len() > SIGNATURE_BODY_CEILING);
        assert_eq!(classify(200, &large, &no_headers()), None);
    }

    #[test]
    fn signature_match_is_case_insensitive() {
        let body = format!("{}Checking Your Browser{}", real_body(1500), real_body(1500));
        assert_eq!(classify(200, &body, &no_headers()), Some(BlockReason::BotChallenge));
    }

    #[test]
    fn challenge_header_is_a_signature_in_small_bodies() {
        let mut headers = HashMap::new();
        headers.insert("CF-Mitigated".to_string(), "challenge".to_string());
        assert_eq!(classify(200, &real_body(5000), &headers), Some(BlockReason::BotChallenge));
    }

    #[test]
    fn challenge_header_on_a_content_rich_page_is_not_a_block() {
        let mut headers = HashMap::new();
        headers.insert("cf-mitigated".to_string(), "challenge".to_string());
        assert_eq!(classify(200, &real_body(50_000), &headers), None);
    }

    #[test]
    fn clean_pages_classify_as_none() {
        assert_eq!(classify(200, &real_body(8000), &no_headers()), None);
        assert_eq!(classify(200, &real_body(80_000), &no_headers()), None);
    }

    #[test]
    fn classify_is_deterministic() {
        let body = format!("{}datadome{}", real_body(1500), real_body(1500));
        let first = classify(200, &body, &no_headers());
        for _ in 0..10 {
            assert_eq!(classify(200, &body, &no_headers()), first);
        }
    }
}
