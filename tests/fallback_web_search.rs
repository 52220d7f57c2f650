use async_trait::async_trait;
use mockito::{Matcher, Server};
use playlist_reconcile::error::SyncError;
use playlist_reconcile::fallback::{Fallback, HumanVerifier, WebSearchResolver};
use playlist_reconcile::models::ProviderKind;
use playlist_reconcile::normalize::normalize;
use playlist_reconcile::retry::RetryConfig;
use playlist_reconcile::similarity::SimilarityEngine;
use playlist_reconcile::state::RunState;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CountingVerifier {
    answer: bool,
    asked: AtomicUsize,
}

#[async_trait]
impl HumanVerifier for CountingVerifier {
    async fn confirm(&self, _challenge_url: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

const RESULTS_PAGE: &str = r#"
<html><body>
  <a href="/url?q=https://open.spotify.com/playlist/xyz&amp;sa=U">Song playlist | Spotify</a>
  <a href="/url?q=https://open.spotify.com/track/7aBc%3Fsi%3Dtracking&amp;sa=U"><h3>Song - song by Band | Spotify</h3></a>
  <a href="https://open.spotify.com/track/9zzz"><h3>Song (Karaoke Version) - song by Cover Kings | Spotify</h3></a>
</body></html>
"#;

fn resolver(base: &str) -> WebSearchResolver {
    let retry = RetryConfig::new()
        .with_max_attempts(2)
        .with_base_delay(Duration::from_millis(1))
        .with_jitter(false);
    WebSearchResolver::new(SimilarityEngine::default(), retry)
        .with_search_url(format!("{}/search", base))
        .with_throttle(Duration::from_millis(1))
}

#[tokio::test]
async fn resolves_first_confident_catalog_link() {
    let mut server = Server::new_async().await;
    let m = server
        .mock("GET", "/search")
        .match_query(Matcher::Regex("open.spotify.com".into()))
        .with_header("content-type", "text/html")
        .with_body(RESULTS_PAGE)
        .expect(1)
        .create_async()
        .await;

    let found = resolver(&server.url())
        .resolve(&RunState::new(false), ProviderKind::Spotify, &normalize("Song", "Band"))
        .await
        .unwrap()
        .expect("a track");

    assert_eq!(found.provider_id, "spotify:track:7aBc");
    assert_eq!(found.normalized_key(), normalize("Song", "Band"));
    m.assert_async().await;
}

#[tokio::test]
async fn low_confidence_results_are_rejected() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/search")
        .match_query(Matcher::Any)
        .with_body(RESULTS_PAGE)
        .create_async()
        .await;

    let found = resolver(&server.url())
        .resolve(&RunState::new(false), ProviderKind::Spotify, &normalize("Completely Different", "Nobody"))
        .await
        .unwrap();

    assert!(found.is_none());
}

#[tokio::test]
async fn bot_check_without_confirmation_reports_not_found() {
    let mut server = Server::new_async().await;
    let m = server
        .mock("GET", "/search")
        .match_query(Matcher::Any)
        .with_status(429)
        .expect(1)
        .create_async()
        .await;
    let verifier = Arc::new(CountingVerifier { answer: false, asked: AtomicUsize::new(0) });

    let found = resolver(&server.url())
        .with_verifier(verifier.clone())
        .resolve(&RunState::new(false), ProviderKind::Spotify, &normalize("Song", "Band"))
        .await
        .unwrap();

    assert!(found.is_none());
    assert_eq!(verifier.asked.load(Ordering::SeqCst), 1);
    m.assert_async().await;
}

#[tokio::test]
async fn bot_check_is_retried_once_after_confirmation() {
    let mut server = Server::new_async().await;
    let challenge = server
        .mock("GET", "/search")
        .match_query(Matcher::Any)
        .with_status(429)
        .expect(1)
        .create_async()
        .await;
    let page = server
        .mock("GET", "/search")
        .match_query(Matcher::Any)
        .with_body(RESULTS_PAGE)
        .expect(1)
        .create_async()
        .await;
    let verifier = Arc::new(CountingVerifier { answer: true, asked: AtomicUsize::new(0) });

    let found = resolver(&server.url())
        .with_verifier(verifier.clone())
        .resolve(&RunState::new(false), ProviderKind::Spotify, &normalize("Song", "Band"))
        .await
        .unwrap();

    assert_eq!(found.map(|t| t.provider_id), Some("spotify:track:7aBc".to_string()));
    assert_eq!(verifier.asked.load(Ordering::SeqCst), 1);
    challenge.assert_async().await;
    page.assert_async().await;
}

#[tokio::test]
async fn searches_are_serialized_and_throttled() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/search")
        .match_query(Matcher::Any)
        .with_body("<html></html>")
        .expect(3)
        .create_async()
        .await;
    let r = Arc::new(resolver(&server.url()).with_throttle(Duration::from_millis(40)));
    let state = Arc::new(RunState::new(false));

    let started = Instant::now();
    let mut handles = Vec::new();
    for title in ["One", "Two", "Three"] {
        let r = r.clone();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            r.resolve(&state, ProviderKind::YouTube, &normalize(title, "Band")).await
        }));
    }
    for h in handles {
        assert!(h.await.unwrap().unwrap().is_none());
    }
    assert!(started.elapsed() >= Duration::from_millis(120));
}

#[tokio::test]
async fn search_engine_failures_are_not_reported_as_provider_errors() {
    let mut server = Server::new_async().await;
    let m = server
        .mock("GET", "/search")
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(2)
        .create_async()
        .await;

    let err = resolver(&server.url())
        .resolve(&RunState::new(false), ProviderKind::Spotify, &normalize("Song", "Band"))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::WebSearch { provider: ProviderKind::Spotify, .. }), "{:?}", err);
    assert!(err.to_string().contains("web search"));
    m.assert_async().await;
}
