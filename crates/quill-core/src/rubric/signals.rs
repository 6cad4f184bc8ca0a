//! Narrative signal derivation.
//!
//! When a case carries free text but no numeric sentiment, a keyword count
//! gives a coarse, always-available estimate in `[-1.0, -0.1]`.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Negative markers in customer narratives.
    static ref NEGATIVE_MARKERS: Vec<Regex> = vec![
        Regex::new(r"(?i)\bfrustrat").unwrap(),
        Regex::new(r"(?i)\bdisappoint").unwrap(),
        Regex::new(r"(?i)\bcancel").unwrap(),
        Regex::new(r"(?i)\bswitch(ing)?\s+to\b").unwrap(),
        Regex::new(r"(?i)\bcompetitor").unwrap(),
        Regex::new(r"(?i)\bunhappy\b").unwrap(),
        Regex::new(r"(?i)\bangry\b").unwrap(),
        Regex::new(r"(?i)\bbroken\b").unwrap(),
        Regex::new(r"(?i)\bunacceptable\b").unwrap(),
        Regex::new(r"(?i)\bterrible\b").unwrap(),
        Regex::new(r"(?i)\bworst\b").unwrap(),
        Regex::new(r"(?i)\bslow\b").unwrap(),
        Regex::new(r"(?i)\bbug(s|gy)?\b").unwrap(),
        Regex::new(r"(?i)\btoo expensive\b").unwrap(),
        Regex::new(r"(?i)\bnot worth\b").unwrap(),
        Regex::new(r"(?i)\brefund\b").unwrap(),
    ];
}

/// Count distinct negative markers present in `text`.
pub fn negative_hits(text: &str) -> usize {
    NEGATIVE_MARKERS.iter().filter(|p| p.is_match(text)).count()
}

/// Keyword sentiment: `max(-1, -0.1 - 0.15 * hits)`.
pub fn keyword_sentiment(text: &str) -> f64 {
    let hits = negative_hits(text) as f64;
    (-0.1 - 0.15 * hits).max(-1.0)
}
