//! Catalog lookup through a public web search, used once a provider's native
//! search is blocked by its daily quota.

use crate::error::{ProviderError, Result, SyncError};
use crate::models::{ProviderKind, Track};
use crate::normalize::NormalizedKey;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::similarity::{jaccard, token_set, SimilarityEngine};
use crate::state::RunState;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const DEFAULT_SEARCH_URL: &str = "https://www.google.com/search";

/// Candidates ranked below this token overlap are not considered at all.
const MIN_RANK_SCORE: f64 = 0.35;

const BROWSER_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

static ANCHOR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?is)<a\s[^>]*?href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static SPOTIFY_SONG_BY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.*?)\s+-\s+(?:song|single)(?:\s+and\s+lyrics)?\s+by\s+(.+)$").unwrap());
static SITE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*[-|·]\s*(?:youtube music|youtube|spotify)\s*$").unwrap());

/// Alternate lookup used when native search is unavailable.
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn resolve(&self, state: &RunState, provider: ProviderKind, query: &NormalizedKey) -> Result<Option<Track>>;
}

/// Asks a human to clear an interactive bot check. Returns true once they have.
#[async_trait]
pub trait HumanVerifier: Send + Sync {
    async fn confirm(&self, challenge_url: &str) -> bool;
}

/// Never confirms; the resolver reports not-found instead of waiting.
pub struct NoVerifier;

#[async_trait]
impl HumanVerifier for NoVerifier {
    async fn confirm(&self, challenge_url: &str) -> bool {
        warn!(challenge_url, "web search wants a human check and no verifier is attached");
        false
    }
}

enum SearchPage {
    Html(String),
    Challenge(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebCandidate {
    pub provider_id: String,
    pub text: String,
    pub url: String,
}

pub struct WebSearchResolver {
    client: Client,
    search_url: String,
    throttle: Duration,
    max_results: usize,
    engine: SimilarityEngine,
    retry: RetryConfig,
    verifier: Arc<dyn HumanVerifier>,
    /// One scraped search at a time.
    gate: Semaphore,
}

impl WebSearchResolver {
    pub fn new(engine: SimilarityEngine, retry: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            search_url: DEFAULT_SEARCH_URL.to_string(),
            throttle: Duration::from_millis(200),
            max_results: 8,
            engine,
            retry,
            verifier: Arc::new(NoVerifier),
            gate: Semaphore::new(1),
        }
    }

    pub fn with_search_url(mut self, url: impl Into<String>) -> Self {
        self.search_url = url.into();
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn HumanVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    fn site_filter(provider: ProviderKind) -> &'static str {
        match provider {
            ProviderKind::Spotify => "site:open.spotify.com/track",
            ProviderKind::YouTube => "site:music.youtube.com",
        }
    }

    async fn fetch(&self, state: &RunState, provider: ProviderKind, query: &NormalizedKey) -> Result<SearchPage> {
        let q = format!("{} \"{}\" {}", Self::site_filter(provider), query.title, query.artist)
            .trim()
            .to_string();
        let policy = RetryPolicy::new(provider, self.retry.clone(), 1);
        policy
            .execute(state, "web search", || {
                let req = self
                    .client
                    .get(&self.search_url)
                    .query(&[("q", q.as_str()), ("hl", "en"), ("num", "10"), ("safe", "off"), ("pws", "0")])
                    .header(USER_AGENT, BROWSER_UA);
                async move {
                    let resp = req.send().await.map_err(|e| ProviderError::from_transport(&e))?;
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status == StatusCode::TOO_MANY_REQUESTS || final_url.to_lowercase().contains("/sorry") {
                        return Ok(SearchPage::Challenge(final_url));
                    }
                    if status.is_server_error() {
                        return Err(ProviderError::Transient(format!("web search {}", status)));
                    }
                    if !status.is_success() {
                        return Err(ProviderError::Fatal(format!("web search {}", status)));
                    }
                    let body = resp.text().await.map_err(|e| ProviderError::from_transport(&e))?;
                    Ok(SearchPage::Html(body))
                }
            })
            .await
            .map_err(|e| match e {
                SyncError::RetryExhausted { attempts, last_error, .. } => SyncError::WebSearch {
                    provider,
                    message: format!("gave up after {} attempts: {}", attempts, last_error),
                },
                SyncError::Fatal { message, .. } => SyncError::WebSearch { provider, message },
                other => other,
            })
    }

    /// The first ranked candidate that also passes the similarity threshold.
    pub fn pick(&self, query: &NormalizedKey, candidates: &[WebCandidate]) -> Option<Track> {
        let wanted = Track::new(query.title.clone(), query.artist.clone(), "");
        for (rank, cand) in rank_candidates(query, candidates) {
            if rank < MIN_RANK_SCORE {
                break;
            }
            let best = split_result_text(&cand.text)
                .into_iter()
                .map(|(title, artist)| {
                    let t = Track::new(title, artist, cand.provider_id.clone());
                    (self.engine.compare(&wanted, &t), t)
                })
                .max_by(|a, b| a.0.score.partial_cmp(&b.0.score).unwrap_or(std::cmp::Ordering::Equal));
            match best {
                Some((m, t)) if m.is_duplicate => {
                    debug!(rank, score = m.score, text = %cand.text, "web candidate accepted");
                    return Some(t);
                }
                Some((m, _)) => debug!(rank, score = m.score, text = %cand.text, "web candidate below threshold"),
                None => {}
            }
        }
        None
    }
}

#[async_trait]
impl Fallback for WebSearchResolver {
    async fn resolve(&self, state: &RunState, provider: ProviderKind, query: &NormalizedKey) -> Result<Option<Track>> {
        let _permit = match self.gate.acquire().await {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };

        let body = match self.fetch(state, provider, query).await? {
            SearchPage::Html(body) => body,
            SearchPage::Challenge(url) => {
                info!(%url, "web search asked for a human check");
                if !self.verifier.confirm(&url).await {
                    return Ok(None);
                }
                match self.fetch(state, provider, query).await? {
                    SearchPage::Html(body) => body,
                    SearchPage::Challenge(_) => {
                        warn!(query = %query, "still challenged after confirmation; reporting not found");
                        return Ok(None);
                    }
                }
            }
        };
        tokio::time::sleep(self.throttle).await;

        let candidates = extract_candidates(&body, provider, self.max_results);
        debug!(provider = %provider, query = %query, candidates = candidates.len(), "web results");
        Ok(self.pick(query, &candidates))
    }
}

/// Catalog links in a search result page, in page order, one per catalog id.
pub fn extract_candidates(html: &str, provider: ProviderKind, max_results: usize) -> Vec<WebCandidate> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cap in ANCHOR.captures_iter(html) {
        let href = unescape(&cap[1]);
        let text = unescape(&TAG.replace_all(&cap[2], " "));
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            continue;
        }
        let target = unwrap_redirect(&href);
        let id = match provider {
            ProviderKind::Spotify => parse_spotify_track(&target),
            ProviderKind::YouTube => parse_youtube_video(&target),
        };
        if let Some(id) = id {
            if seen.insert(id.clone()) {
                out.push(WebCandidate { provider_id: id, text, url: target });
                if out.len() >= max_results {
                    break;
                }
            }
        }
    }
    out
}

/// Token-overlap ranking, best first.
pub fn rank_candidates<'a>(query: &NormalizedKey, candidates: &'a [WebCandidate]) -> Vec<(f64, &'a WebCandidate)> {
    let title_tokens = token_set(&query.title);
    let mut wanted = title_tokens.clone();
    wanted.extend(token_set(&query.artist));

    let mut scored: Vec<(f64, &WebCandidate)> = candidates
        .iter()
        .map(|c| {
            let got = token_set(&c.text);
            let mut score = jaccard(&wanted, &got);
            if !title_tokens.is_empty() && title_tokens.is_subset(&got) {
                score += 0.15;
            }
            if c.url.contains("/playlist") {
                score -= 0.08;
            }
            (score, c)
        })
        .collect();
    // Stable sort keeps page order among equal scores.
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Possible (title, artist) readings of a result title.
fn split_result_text(text: &str) -> Vec<(String, String)> {
    let text = SITE_SUFFIX.replace(text, "").trim().to_string();
    if let Some(c) = SPOTIFY_SONG_BY.captures(&text) {
        return vec![(c[1].trim().to_string(), c[2].trim().to_string())];
    }
    match text.split_once(" - ") {
        Some((a, b)) => vec![
            (a.trim().to_string(), b.trim().to_string()),
            (b.trim().to_string(), a.trim().to_string()),
        ],
        None => Vec::new(),
    }
}

fn unescape(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
}

/// Google wraps result links as `/url?q=<target>&...`.
fn unwrap_redirect(href: &str) -> String {
    if href.starts_with("/url?") {
        if let Ok(u) = url::Url::parse(&format!("https://www.google.com{}", href)) {
            if let Some((_, target)) = u.query_pairs().find(|(k, _)| k == "q") {
                return target.into_owned();
            }
        }
    }
    href.to_string()
}

/// `spotify:track:<id>` for Spotify track URIs and open.spotify.com links.
pub fn parse_spotify_track(value: &str) -> Option<String> {
    let candidate = value.trim();
    if candidate.is_empty() {
        return None;
    }
    if let Some(id) = candidate.strip_prefix("spotify:track:") {
        return if id.is_empty() { None } else { Some(candidate.to_string()) };
    }
    let parsed = url::Url::parse(candidate).ok()?;
    if !parsed.host_str()?.ends_with("open.spotify.com") {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    // Localised links look like /intl-de/track/<id>.
    let pos = segments.iter().position(|s| *s == "track")?;
    let id = segments.get(pos + 1)?;
    Some(format!("spotify:track:{}", id))
}

/// Video id from youtu.be, youtube.com and music.youtube.com watch links.
pub fn parse_youtube_video(value: &str) -> Option<String> {
    let parsed = url::Url::parse(value.trim()).ok()?;
    let host = parsed.host_str()?;
    if host == "youtu.be" {
        let id = parsed.path().trim_start_matches('/');
        return if id.is_empty() { None } else { Some(id.to_string()) };
    }
    if host.ends_with("youtube.com") && parsed.path() == "/watch" {
        return parsed
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty());
    }
    None
}
