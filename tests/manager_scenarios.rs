use async_trait::async_trait;
use playlist_reconcile::api::mock::MockAdapter;
use playlist_reconcile::error::{ProviderError, Result};
use playlist_reconcile::fallback::Fallback;
use playlist_reconcile::manager::Manager;
use playlist_reconcile::models::{AddOutcome, BatchStatus, PlaylistRef, ProviderKind, RemoveOutcome, Track};
use playlist_reconcile::normalize::{normalize, NormalizedKey};
use playlist_reconcile::similarity::SimilarityEngine;
use playlist_reconcile::state::RunState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Answers from a fixed table and counts how often it was asked.
struct ScriptedFallback {
    answers: HashMap<String, Track>,
    calls: AtomicUsize,
}

impl ScriptedFallback {
    fn new(answers: Vec<Track>) -> Self {
        Self {
            answers: answers.into_iter().map(|t| (t.normalized_key().key(), t)).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Fallback for ScriptedFallback {
    async fn resolve(&self, _state: &RunState, _provider: ProviderKind, query: &NormalizedKey) -> Result<Option<Track>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answers.get(&query.key()).cloned())
    }
}

fn src_ref() -> PlaylistRef {
    PlaylistRef::new(ProviderKind::Spotify, "src")
}

fn dst_ref() -> PlaylistRef {
    PlaylistRef::new(ProviderKind::YouTube, "dst")
}

fn catalog() -> Vec<Track> {
    vec![
        Track::new("Hello World", "Band", "vid-hello"),
        Track::new("Other Song", "Singer", "vid-other"),
        Track::new("Third Tune", "Trio", "vid-third"),
    ]
}

fn setup(source: Vec<Track>, destination: Vec<Track>) -> (Arc<MockAdapter>, Arc<MockAdapter>, Manager) {
    let sp = Arc::new(MockAdapter::new(ProviderKind::Spotify).with_playlist("src", source));
    let yt = Arc::new(
        MockAdapter::new(ProviderKind::YouTube)
            .with_playlist("dst", destination)
            .with_catalog(catalog()),
    );
    let manager = Manager::new(SimilarityEngine::default())
        .with_adapter(sp.clone())
        .with_adapter(yt.clone());
    (sp, yt, manager)
}

#[tokio::test]
async fn adds_only_the_track_without_a_close_match() {
    let source = vec![
        Track::new("Hello World", "Band", "spotify:track:a"),
        Track::new("Other Song", "Singer", "spotify:track:b"),
    ];
    // 0.94-similar to the first source track.
    let destination = vec![Track::new("Hello Worlds", "Band", "vid-existing")];
    let (_sp, yt, manager) = setup(source, destination);
    let state = RunState::new(false);

    let report = manager.add_missing(&state, &src_ref(), &dst_ref()).await.unwrap();

    assert_eq!(report.status, BatchStatus::Success);
    match &report.items[0].outcome {
        AddOutcome::AlreadyPresent { matched, score } => {
            assert_eq!(matched.provider_id, "vid-existing");
            assert!(*score >= 0.9 && *score < 1.0);
        }
        other => panic!("unexpected {:?}", other),
    }
    match &report.items[1].outcome {
        AddOutcome::Added { resolved, via_fallback } => {
            assert_eq!(resolved.provider_id, "vid-other");
            assert!(!via_fallback);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(yt.applied_edits(), 1);
    let ids: Vec<String> = yt.playlist("dst").into_iter().map(|t| t.provider_id).collect();
    assert_eq!(ids, vec!["vid-existing", "vid-other"]);
}

#[tokio::test]
async fn second_run_adds_nothing() {
    let source = vec![
        Track::new("Hello World", "Band", "spotify:track:a"),
        Track::new("Other Song", "Singer", "spotify:track:b"),
        Track::new("Third Tune", "Trio", "spotify:track:c"),
    ];
    let (_sp, yt, manager) = setup(source, vec![]);

    let first = manager.add_missing(&RunState::new(false), &src_ref(), &dst_ref()).await.unwrap();
    assert!(first.items.iter().all(|i| matches!(i.outcome, AddOutcome::Added { .. })));
    assert_eq!(yt.playlist("dst").len(), 3);

    let second = manager.add_missing(&RunState::new(false), &src_ref(), &dst_ref()).await.unwrap();
    assert!(second
        .items
        .iter()
        .all(|i| matches!(i.outcome, AddOutcome::AlreadyPresent { .. })));
    assert_eq!(yt.playlist("dst").len(), 3);
    assert_eq!(yt.applied_edits(), 3);
}

#[tokio::test]
async fn equal_keys_are_searched_once_and_added_once() {
    let source = vec![
        Track::new("Hello World", "Band", "spotify:track:a"),
        Track::new("Hello World (Live)", "Band", "spotify:track:b"),
    ];
    let (_sp, yt, manager) = setup(source, vec![]);
    let state = RunState::new(false);

    let report = manager.add_missing(&state, &src_ref(), &dst_ref()).await.unwrap();

    assert_eq!(yt.native_searches(), 1);
    assert!(matches!(report.items[0].outcome, AddOutcome::Added { .. }));
    assert!(matches!(report.items[1].outcome, AddOutcome::AlreadyPresent { .. }));
    assert_eq!(yt.playlist("dst").len(), 1);
}

#[tokio::test]
async fn unresolvable_tracks_are_reported_not_failed() {
    let source = vec![Track::new("Nowhere To Be Found", "Ghost", "spotify:track:z")];
    let (_sp, yt, manager) = setup(source, vec![]);

    let report = manager.add_missing(&RunState::new(false), &src_ref(), &dst_ref()).await.unwrap();

    assert!(matches!(report.items[0].outcome, AddOutcome::NoMatch));
    assert_eq!(report.status, BatchStatus::Success);
    assert_eq!(yt.applied_edits(), 0);
}

#[tokio::test]
async fn quota_exhaustion_routes_later_searches_to_the_fallback() {
    let source = vec![
        Track::new("Alpha", "Band", "spotify:track:1"),
        Track::new("Beta", "Band", "spotify:track:2"),
        Track::new("Gamma", "Band", "spotify:track:3"),
    ];
    let (_sp, yt, manager) = setup(source, vec![]);
    yt.push_search_error(ProviderError::QuotaExhausted("quotaExceeded".into()));
    let fallback = Arc::new(ScriptedFallback::new(vec![
        Track::new("Alpha", "Band", "web-alpha"),
        Track::new("Beta", "Band", "web-beta"),
        Track::new("Gamma", "Band", "web-gamma"),
    ]));
    let manager = manager.with_fallback(fallback.clone()).with_concurrency_limit(1);
    let state = RunState::new(false);

    let report = manager.add_missing(&state, &src_ref(), &dst_ref()).await.unwrap();

    assert!(state.is_quota_exhausted(ProviderKind::YouTube));
    assert_eq!(yt.native_searches(), 1, "no native search after the quota signal");
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 3);
    for item in &report.items {
        match &item.outcome {
            AddOutcome::Added { resolved, via_fallback } => {
                assert!(via_fallback);
                assert!(resolved.provider_id.starts_with("web-"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn quota_without_fallback_reports_no_match() {
    let source = vec![Track::new("Hello World", "Band", "spotify:track:a")];
    let (_sp, yt, manager) = setup(source, vec![]);
    yt.push_search_error(ProviderError::QuotaExhausted("quotaExceeded".into()));
    let state = RunState::new(false);

    let report = manager.add_missing(&state, &src_ref(), &dst_ref()).await.unwrap();

    assert!(matches!(report.items[0].outcome, AddOutcome::NoMatch));
    assert!(state.is_quota_exhausted(ProviderKind::YouTube));
}

#[tokio::test]
async fn one_failed_add_does_not_abort_the_batch() {
    let source = vec![
        Track::new("Hello World", "Band", "spotify:track:a"),
        Track::new("Other Song", "Singer", "spotify:track:b"),
        Track::new("Third Tune", "Trio", "spotify:track:c"),
    ];
    let (_sp, yt, manager) = setup(source, vec![]);
    yt.fail_edits_for("vid-other");

    let report = manager.add_missing(&RunState::new(false), &src_ref(), &dst_ref()).await.unwrap();

    assert_eq!(report.status, BatchStatus::PartialFailure);
    assert!(matches!(report.items[0].outcome, AddOutcome::Added { .. }));
    assert!(matches!(report.items[1].outcome, AddOutcome::Failed { .. }));
    assert!(matches!(report.items[2].outcome, AddOutcome::Added { .. }));
    assert_eq!(report.failures().count(), 1);
}

#[tokio::test]
async fn search_failures_are_per_item() {
    let source = vec![Track::new("Hello World", "Band", "spotify:track:a")];
    let (_sp, yt, manager) = setup(source, vec![]);
    yt.push_search_error(ProviderError::Fatal("bad request".into()));

    let report = manager.add_missing(&RunState::new(false), &src_ref(), &dst_ref()).await.unwrap();

    assert_eq!(report.status, BatchStatus::Failure);
    assert!(matches!(report.items[0].outcome, AddOutcome::Failed { .. }));
}

#[tokio::test]
async fn plan_mode_reports_without_editing() {
    let source = vec![
        Track::new("Hello World", "Band", "spotify:track:a"),
        Track::new("Other Song", "Singer", "spotify:track:b"),
    ];
    let (_sp, yt, manager) = setup(source, vec![Track::new("Hello World", "Band", "vid-hello")]);
    let state = RunState::new(true);

    let report = manager.add_missing(&state, &src_ref(), &dst_ref()).await.unwrap();

    assert!(report.plan_mode);
    assert!(matches!(report.items[0].outcome, AddOutcome::AlreadyPresent { .. }));
    assert!(matches!(report.items[1].outcome, AddOutcome::Planned { .. }));
    assert_eq!(yt.applied_edits(), 0);
    assert_eq!(yt.playlist("dst").len(), 1);
}

#[tokio::test]
async fn interrupted_run_skips_remaining_items() {
    let source = vec![
        Track::new("Hello World", "Band", "spotify:track:a"),
        Track::new("Other Song", "Singer", "spotify:track:b"),
    ];
    let (_sp, yt, manager) = setup(source, vec![Track::new("Hello World", "Band", "vid-hello")]);
    let state = RunState::new(false);
    state.interrupt();

    let report = manager.add_missing(&state, &src_ref(), &dst_ref()).await.unwrap();

    assert!(matches!(report.items[0].outcome, AddOutcome::AlreadyPresent { .. }));
    assert!(matches!(report.items[1].outcome, AddOutcome::Skipped { .. }));
    assert_eq!(yt.native_searches(), 0);
    assert_eq!(yt.applied_edits(), 0);
}

fn messy_playlist() -> Vec<Track> {
    vec![
        Track::new("Song", "Band", "v1"),
        Track::new("Other", "Someone", "v2"),
        Track::new("Song (Live)", "Band", "v3"),
        Track::new("song", "Band feat. X", "v4"),
        Track::new("Other", "Someone", "v2"),
        Track::new("Third", "Artist", "v6"),
    ]
}

#[tokio::test]
async fn dedupe_keeps_one_track_per_group() {
    let yt = Arc::new(MockAdapter::new(ProviderKind::YouTube).with_playlist("dst", messy_playlist()));
    let manager = Manager::new(SimilarityEngine::default()).with_adapter(yt.clone());

    let report = manager.dedupe(&RunState::new(false), &dst_ref()).await.unwrap();

    assert_eq!(report.status, BatchStatus::Success);
    assert_eq!(report.items.len(), 3);
    assert!(report.items.iter().all(|i| matches!(i.outcome, RemoveOutcome::Removed)));
    let kept: Vec<String> = report.items.iter().map(|i| i.kept.clone().unwrap().provider_id).collect();
    assert_eq!(kept, vec!["v1", "v1", "v2"]);

    let remaining: Vec<String> = yt.playlist("dst").into_iter().map(|t| t.provider_id).collect();
    assert_eq!(remaining, vec!["v1", "v2", "v6"]);

    // Already clean: nothing left to do.
    let again = manager.dedupe(&RunState::new(false), &dst_ref()).await.unwrap();
    assert!(again.items.is_empty());
}

#[tokio::test]
async fn dedupe_in_plan_mode_leaves_the_playlist_alone() {
    let yt = Arc::new(MockAdapter::new(ProviderKind::YouTube).with_playlist("dst", messy_playlist()));
    let manager = Manager::new(SimilarityEngine::default()).with_adapter(yt.clone());

    let report = manager.dedupe(&RunState::new(true), &dst_ref()).await.unwrap();

    assert_eq!(report.items.len(), 3);
    assert!(report.items.iter().all(|i| matches!(i.outcome, RemoveOutcome::Planned)));
    assert_eq!(yt.playlist("dst").len(), 6);
    assert_eq!(yt.applied_edits(), 0);
}

#[tokio::test]
async fn summary_counts_tracks_per_artist() {
    let tracks = vec![
        Track::new("a", "Band", "1"),
        Track::new("b", "Band", "2"),
        Track::new("c", "Zed", "3"),
        Track::new("d", "", "4"),
        Track::new("e", "Abba", "5"),
    ];
    let sp = Arc::new(MockAdapter::new(ProviderKind::Spotify).with_playlist("src", tracks));
    let manager = Manager::new(SimilarityEngine::default()).with_adapter(sp);

    let summary = manager.summarize_by_artist(&RunState::new(false), &src_ref()).await.unwrap();

    assert_eq!(summary.total_tracks, 5);
    let order: Vec<&str> = summary.artists.iter().map(|a| a.artist.as_str()).collect();
    assert_eq!(order, vec!["Band", "Abba", "Unknown", "Zed"]);
    assert_eq!(summary.count_for("Band"), 2);
}

#[tokio::test]
async fn summary_counts_each_credited_artist() {
    let tracks = vec![Track::new("a", "A, B", "1"), Track::new("b", "A", "2"), Track::new("c", " ; ", "3")];
    let sp = Arc::new(MockAdapter::new(ProviderKind::Spotify).with_playlist("src", tracks));
    let manager = Manager::new(SimilarityEngine::default()).with_adapter(sp);

    let summary = manager.summarize_by_artist(&RunState::new(false), &src_ref()).await.unwrap();

    assert_eq!(summary.total_tracks, 3);
    assert_eq!(summary.count_for("A"), 2);
    assert_eq!(summary.count_for("B"), 1);
    assert_eq!(summary.count_for("Unknown"), 1);
    assert_eq!(summary.count_for("A, B"), 0);
}

#[tokio::test]
async fn removes_tracks_by_artist() {
    let tracks = vec![
        Track::new("a", "Band", "1"),
        Track::new("b", "Someone", "2"),
        Track::new("c", "BAND", "3"),
        Track::new("d", "Other, band", "4"),
    ];
    let sp = Arc::new(MockAdapter::new(ProviderKind::Spotify).with_playlist("src", tracks));
    let manager = Manager::new(SimilarityEngine::default()).with_adapter(sp.clone());

    let report = manager
        .remove_by_artists(&RunState::new(false), &src_ref(), &["band".to_string()])
        .await
        .unwrap();

    let removed: Vec<&str> = report.items.iter().map(|i| i.track.provider_id.as_str()).collect();
    assert_eq!(removed, vec!["1", "3", "4"]);
    let remaining: Vec<String> = sp.playlist("src").into_iter().map(|t| t.provider_id).collect();
    assert_eq!(remaining, vec!["2"]);
}

#[tokio::test]
async fn unknown_provider_is_an_error() {
    let manager = Manager::new(SimilarityEngine::default());
    let err = manager.dedupe(&RunState::new(false), &dst_ref()).await.unwrap_err();
    assert!(err.to_string().contains("youtube"));
}

#[test]
fn scripted_fallback_keys_match_normalizer() {
    let f = ScriptedFallback::new(vec![Track::new("Alpha (Remastered)", "Band", "x")]);
    assert!(f.answers.contains_key(&normalize("alpha", "Band feat. Y").key()));
}
