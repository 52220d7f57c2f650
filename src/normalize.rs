//! Canonical comparison keys for track titles and artists.
//!
//! `normalize` is total and idempotent: feeding a key's `title` and `artist`
//! back in yields the same key.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// "(feat. X)", "[ft X]", "(featuring X)"
static BRACKET_FEAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\(\[\{]\s*(?:featuring|feat|ft)\b\.?\s*([^\)\]\}]*)[\)\]\}]").unwrap());

/// "Song feat. X", "Band ft X", "Song-ft-X"
static INLINE_FEAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s\-–—_/.,]+(?:featuring|feat|ft)\b\.?[\s\-–—_/.,]+(.*)$").unwrap());

static BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\(\[\{][^\(\)\[\]\{\}]*[\)\]\}]").unwrap());

/// "Song - Remastered 2011", "Song - Live at Wembley"
static DASH_QUALIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\s+[-–—]\s+[^-–—]*\b(?:remaster(?:ed)?|live|radio edit|edit|version|mono|stereo|remix|mix|acoustic|demo|instrumental|single)\b.*$",
    )
    .unwrap()
});

static DASH_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+[-–—|]\s+").unwrap());

static ARTIST_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[,;/]\s*").unwrap());

/// YouTube auto-generated channels: "Band - Topic".
static TOPIC_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[-–—]\s*topic$").unwrap());

/// Comparable form of a (title, artist) pair.
///
/// Equality and hashing only consider `title` and `artist`; featured artists are
/// kept aside so "Song feat. X" and "Song" share a key.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedKey {
    pub title: String,
    pub artist: String,
    pub featured: Vec<String>,
}

impl NormalizedKey {
    /// String form used as the search cache key.
    pub fn key(&self) -> String {
        format!("{}::{}", self.title, self.artist)
    }

    pub fn is_blank(&self) -> bool {
        self.title.is_empty() || self.artist.is_empty()
    }

    /// Free-text query for provider search endpoints.
    pub fn query(&self) -> String {
        format!("{} {}", self.title, self.artist).trim().to_string()
    }
}

impl PartialEq for NormalizedKey {
    fn eq(&self, other: &Self) -> bool {
        self.title == other.title && self.artist == other.artist
    }
}

impl Eq for NormalizedKey {}

impl Hash for NormalizedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.title.hash(state);
        self.artist.hash(state);
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

pub fn normalize(title: &str, artist: &str) -> NormalizedKey {
    let mut featured = Vec::new();

    let (primary_artist, artist_featured) = split_artist(&fold(artist));
    featured.extend(artist_featured);

    let mut t = fold(title);
    t = take_featured(&t, &mut featured);
    t = strip_or_keep(&t, |s| BRACKETED.replace_all(s, " ").into_owned());
    t = strip_or_keep(&t, |s| DASH_QUALIFIER.replace(s, "").into_owned());
    t = drop_artist_segment(&t, &primary_artist);

    let title = settle_featured(&clean(&t), &mut featured);

    featured.sort();
    featured.dedup();

    NormalizedKey {
        title,
        artist: primary_artist,
        featured,
    }
}

/// Lower-case and strip diacritics. Lower-casing runs on both sides of NFKD so
/// compatibility decompositions that yield upper-case letters are folded too.
fn fold(s: &str) -> String {
    let decomposed: String = s
        .to_lowercase()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect();
    decomposed
        .to_lowercase()
        .chars()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// Alphanumerics survive, apostrophes vanish, `&` reads as "and", everything
/// else becomes a single space.
fn clean(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\'' | '’' | '`' | '´' => {}
            '&' => out.push_str(" and "),
            c if c.is_alphanumeric() => out.push(c),
            _ => out.push(' '),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Apply a stripping step unless it would leave nothing comparable.
fn strip_or_keep(s: &str, step: impl Fn(&str) -> String) -> String {
    let stripped = step(s);
    if clean(&stripped).is_empty() {
        s.to_string()
    } else {
        stripped
    }
}

fn take_featured(s: &str, featured: &mut Vec<String>) -> String {
    let mut out = s.to_string();
    if let Some(c) = BRACKET_FEAT.captures(&out) {
        featured.extend(split_names(&c[1]));
        out = BRACKET_FEAT.replace(&out, " ").into_owned();
    }
    if let Some(c) = INLINE_FEAT.captures(&out) {
        let names = split_names(&c[1]);
        let rest = INLINE_FEAT.replace(&out, "").into_owned();
        if !clean(&rest).is_empty() {
            featured.extend(names);
            out = rest;
        }
    }
    out
}

/// Re-run feat extraction on cleaned text until nothing more comes off, so a
/// cleaned key never exposes a new "ft" segment.
fn settle_featured(cleaned: &str, featured: &mut Vec<String>) -> String {
    let mut current = cleaned.to_string();
    loop {
        let next = clean(&take_featured(&current, featured));
        if next == current {
            return current;
        }
        current = next;
    }
}

fn split_names(s: &str) -> Vec<String> {
    ARTIST_SEPARATORS
        .split(s)
        .flat_map(|part| part.split(" and ").map(str::to_string).collect::<Vec<_>>())
        .flat_map(|part| part.split(" & ").map(str::to_string).collect::<Vec<_>>())
        .map(|part| clean(&part))
        .filter(|part| !part.is_empty())
        .collect()
}

/// First credited artist becomes the comparison artist; the rest are featured.
fn split_artist(folded: &str) -> (String, Vec<String>) {
    let mut featured = Vec::new();
    let mut s = take_featured(folded, &mut featured);
    s = strip_or_keep(&s, |s| BRACKETED.replace_all(s, " ").into_owned());

    let mut parts = ARTIST_SEPARATORS.split(&s).map(str::to_string);
    let first = parts.next().unwrap_or_default();
    featured.extend(parts.flat_map(|p| split_names(&p)));

    let first = strip_or_keep(first.trim(), |s| TOPIC_SUFFIX.replace(s, "").into_owned());
    let mut primary = settle_featured(&clean(&first), &mut featured);
    while primary.len() > "vevo".len() && primary.ends_with("vevo") {
        primary.truncate(primary.len() - "vevo".len());
        primary = clean(&primary);
    }
    (primary, featured)
}

/// YouTube uploads are often titled "Artist - Song"; drop the segment that is
/// just the artist name.
fn drop_artist_segment(title: &str, artist: &str) -> String {
    if artist.is_empty() {
        return title.to_string();
    }
    let segments: Vec<&str> = DASH_SPLIT.split(title).collect();
    if segments.len() < 2 {
        return title.to_string();
    }
    let kept: Vec<&str> = segments
        .iter()
        .copied()
        .filter(|seg| clean(seg) != artist)
        .collect();
    if kept.is_empty() || kept.iter().all(|seg| clean(seg).is_empty()) {
        return title.to_string();
    }
    kept.join(" ")
}
