//! Duplicate detection between two tracks.

use crate::models::{MatchResult, Track};
use crate::normalize::NormalizedKey;
use std::collections::HashSet;

pub const DEFAULT_THRESHOLD: f64 = 0.90;

/// Title carries more identity than artist; weights sum to 1.
const TITLE_WEIGHT: f64 = 0.7;
const ARTIST_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy)]
pub struct SimilarityEngine {
    threshold: f64,
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self { threshold: DEFAULT_THRESHOLD }
    }
}

impl SimilarityEngine {
    pub fn new(threshold: f64) -> Self {
        Self { threshold: threshold.clamp(0.0, 1.0) }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score `a` against `b`. `matched_track` is `b` when the pair is a duplicate.
    pub fn compare(&self, a: &Track, b: &Track) -> MatchResult {
        let score = score_keys(&a.normalized_key(), &b.normalized_key());
        self.classify(score, b)
    }

    /// Same as `compare` with precomputed keys, for the quadratic passes in dedupe.
    pub fn compare_keys(&self, a: &NormalizedKey, b: &NormalizedKey, b_track: &Track) -> MatchResult {
        self.classify(score_keys(a, b), b_track)
    }

    /// A zero score (blank keys) is never a duplicate, even at threshold 0.
    pub fn is_duplicate_score(&self, score: f64) -> bool {
        score > 0.0 && score >= self.threshold
    }

    fn classify(&self, score: f64, candidate: &Track) -> MatchResult {
        let is_duplicate = self.is_duplicate_score(score);
        MatchResult {
            score,
            is_duplicate,
            matched_track: if is_duplicate { Some(candidate.clone()) } else { None },
        }
    }
}

/// Symmetric score in [0, 1]. Blank keys never match; equal keys short-circuit to 1.
pub fn score_keys(a: &NormalizedKey, b: &NormalizedKey) -> f64 {
    if a.is_blank() || b.is_blank() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let title = strsim::normalized_levenshtein(&a.title, &b.title);
    let artist = strsim::normalized_levenshtein(&a.artist, &b.artist).max(jaccard(&token_set(&a.artist), &token_set(&b.artist)));
    (TITLE_WEIGHT * title + ARTIST_WEIGHT * artist).clamp(0.0, 1.0)
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "feat", "featuring", "official", "video", "audio", "ft", "con", "with", "lyrics", "lyric",
];

/// Lower-cased alphanumeric words with filler removed.
pub fn token_set(text: &str) -> HashSet<String> {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    lowered
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        inter as f64 / union as f64
    }
}
