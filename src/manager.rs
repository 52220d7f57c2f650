//! Reconciliation operations over remote playlists.
//!
//! The manager only talks to providers through [`Adapter`] and to the web
//! search through [`Fallback`]; both receive the caller's [`RunState`].

use crate::api::Adapter;
use crate::error::{Result, SyncError};
use crate::fallback::Fallback;
use crate::models::{
    AddItem, AddOutcome, ArtistCount, ArtistSummary, BatchReport, EditOutcome, PlaylistRef, ProviderKind,
    RemoveItem, RemoveOutcome, Track,
};
use crate::normalize::NormalizedKey;
use crate::similarity::SimilarityEngine;
use crate::state::RunState;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const INTERRUPTED: &str = "interrupted";

pub struct Manager {
    adapters: HashMap<ProviderKind, Arc<dyn Adapter>>,
    fallback: Option<Arc<dyn Fallback>>,
    engine: SimilarityEngine,
    concurrency_limit: usize,
}

/// A destination track found for a source track.
struct Resolved {
    track: Track,
    via_fallback: bool,
}

impl Manager {
    pub fn new(engine: SimilarityEngine) -> Self {
        Self {
            adapters: HashMap::new(),
            fallback: None,
            engine,
            concurrency_limit: 4,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Fallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    fn adapter(&self, provider: ProviderKind) -> Result<&Arc<dyn Adapter>> {
        self.adapters.get(&provider).ok_or(SyncError::MissingAdapter(provider))
    }

    /// Track count per credited artist, most frequent first. A track credited to
    /// "A, B" counts once for each.
    pub async fn summarize_by_artist(&self, state: &RunState, playlist: &PlaylistRef) -> Result<ArtistSummary> {
        let tracks = self.adapter(playlist.provider)?.list_tracks(state, playlist).await?;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for t in &tracks {
            let mut credited = credited_artists(&t.artist).peekable();
            if credited.peek().is_none() {
                *counts.entry("Unknown".to_string()).or_insert(0) += 1;
            }
            for artist in credited {
                *counts.entry(artist.to_string()).or_insert(0) += 1;
            }
        }
        let mut artists: Vec<ArtistCount> = counts
            .into_iter()
            .map(|(artist, count)| ArtistCount { artist, count })
            .collect();
        artists.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.artist.cmp(&b.artist)));

        log::info!("Summarized {} tracks by {} artists in {}", tracks.len(), artists.len(), playlist);
        Ok(ArtistSummary {
            playlist: playlist.clone(),
            total_tracks: tracks.len(),
            artists,
        })
    }

    /// Copies source tracks that have no duplicate in `destination` over to it.
    ///
    /// Searches for distinct missing tracks run concurrently; adds are applied
    /// one at a time in source order. A failed item is recorded and the batch
    /// continues.
    pub async fn add_missing(
        &self,
        state: &RunState,
        source: &PlaylistRef,
        destination: &PlaylistRef,
    ) -> Result<BatchReport<AddItem>> {
        let src_adapter = self.adapter(source.provider)?;
        let dst_adapter = self.adapter(destination.provider)?;

        let src_tracks = src_adapter.list_tracks(state, source).await?;
        let dst_tracks = dst_adapter.list_tracks(state, destination).await?;
        let dst_keys: Vec<(NormalizedKey, &Track)> = dst_tracks.iter().map(|t| (t.normalized_key(), t)).collect();
        log::info!(
            "add_missing {} -> {}: {} source, {} destination tracks",
            source,
            destination,
            src_tracks.len(),
            dst_tracks.len()
        );

        let mut outcomes: Vec<Option<AddOutcome>> = Vec::with_capacity(src_tracks.len());
        let mut missing: Vec<(usize, NormalizedKey)> = Vec::new();
        for (idx, track) in src_tracks.iter().enumerate() {
            let key = track.normalized_key();
            let best = dst_keys
                .iter()
                .map(|(k, t)| self.engine.compare_keys(&key, k, t))
                .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
            match best {
                Some(m) if m.is_duplicate => {
                    let matched = m.matched_track.unwrap_or_else(|| track.clone());
                    outcomes.push(Some(AddOutcome::AlreadyPresent { matched, score: m.score }));
                }
                _ => {
                    outcomes.push(None);
                    missing.push((idx, key));
                }
            }
        }

        let resolutions: Vec<(usize, Result<Option<Resolved>>)> = stream::iter(missing)
            .map(|(idx, key)| async move {
                let r = self.resolve(state, destination.provider, dst_adapter, &key).await;
                (idx, r)
            })
            .buffered(self.concurrency_limit)
            .collect()
            .await;
        let mut resolved: HashMap<usize, Result<Option<Resolved>>> = resolutions.into_iter().collect();

        let mut added_ids: HashSet<String> = HashSet::new();
        for (idx, slot) in outcomes.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }
            let outcome = match resolved.remove(&idx) {
                None | Some(Err(SyncError::Interrupted)) => AddOutcome::Skipped { reason: INTERRUPTED.into() },
                Some(Err(e)) => {
                    log::warn!("Could not resolve {}: {}", src_tracks[idx].display(), e);
                    AddOutcome::Failed { error: e.to_string() }
                }
                Some(Ok(None)) => {
                    log::info!("No match on {} for {}", destination.provider, src_tracks[idx].display());
                    AddOutcome::NoMatch
                }
                Some(Ok(Some(found))) => {
                    self.apply_add(state, destination, dst_adapter, found, &mut added_ids).await
                }
            };
            *slot = Some(outcome);
        }

        let items: Vec<AddItem> = src_tracks
            .into_iter()
            .zip(outcomes)
            .map(|(source, outcome)| AddItem {
                source,
                outcome: outcome.unwrap_or(AddOutcome::Skipped { reason: INTERRUPTED.into() }),
            })
            .collect();
        let report = BatchReport::new(destination.clone(), state.plan_mode(), items);
        log::info!("add_missing into {} finished: {:?}", destination, report.status);
        Ok(report)
    }

    async fn apply_add(
        &self,
        state: &RunState,
        destination: &PlaylistRef,
        adapter: &Arc<dyn Adapter>,
        found: Resolved,
        added_ids: &mut HashSet<String>,
    ) -> AddOutcome {
        if state.is_interrupted() {
            return AddOutcome::Skipped { reason: INTERRUPTED.into() };
        }
        // Two source tracks resolving to the same destination track.
        if added_ids.contains(&found.track.provider_id) {
            return AddOutcome::AlreadyPresent { matched: found.track, score: 1.0 };
        }
        match adapter.add_track(state, destination, &found.track.provider_id).await {
            Ok(edit) => {
                added_ids.insert(found.track.provider_id.clone());
                match edit {
                    EditOutcome::Applied => AddOutcome::Added {
                        resolved: found.track,
                        via_fallback: found.via_fallback,
                    },
                    EditOutcome::Planned => AddOutcome::Planned {
                        resolved: found.track,
                        via_fallback: found.via_fallback,
                    },
                    EditOutcome::NoOp => AddOutcome::AlreadyPresent { matched: found.track, score: 1.0 },
                }
            }
            Err(e) => {
                log::error!("Failed to add {} to {}: {}", found.track.provider_id, destination, e);
                AddOutcome::Failed { error: e.to_string() }
            }
        }
    }

    /// Native search while the provider has quota, web fallback afterwards.
    /// Each normalized key is looked up at most once per provider per run.
    async fn resolve(
        &self,
        state: &RunState,
        provider: ProviderKind,
        adapter: &Arc<dyn Adapter>,
        key: &NormalizedKey,
    ) -> Result<Option<Resolved>> {
        if state.is_interrupted() {
            return Err(SyncError::Interrupted);
        }
        if key.is_blank() {
            return Ok(None);
        }
        let used_fallback = AtomicBool::new(false);
        let found = state
            .cached_search(provider, key, || async {
                if !state.is_quota_exhausted(provider) {
                    match adapter.search_track(state, key).await {
                        Err(SyncError::QuotaExhausted { .. }) => {}
                        other => return other,
                    }
                }
                match &self.fallback {
                    Some(fallback) => {
                        used_fallback.store(true, Ordering::SeqCst);
                        fallback.resolve(state, provider, key).await
                    }
                    None => {
                        log::debug!("No fallback configured; {} unresolved on {}", key, provider);
                        Ok(None)
                    }
                }
            })
            .await?;
        Ok(found.map(|track| Resolved {
            track,
            via_fallback: used_fallback.load(Ordering::SeqCst),
        }))
    }

    /// Keeps the first-seen track of every duplicate group and removes the rest.
    pub async fn dedupe(&self, state: &RunState, playlist: &PlaylistRef) -> Result<BatchReport<RemoveItem>> {
        let adapter = self.adapter(playlist.provider)?;
        let tracks = adapter.list_tracks(state, playlist).await?;
        let groups = duplicate_groups(&self.engine, &tracks);

        let doomed: Vec<(usize, Option<Track>)> = groups
            .iter()
            .enumerate()
            .filter(|(i, root)| *i != **root)
            .map(|(i, root)| (i, Some(tracks[*root].clone())))
            .collect();
        log::info!(
            "dedupe {}: {} tracks, {} duplicates to remove",
            playlist,
            tracks.len(),
            doomed.len()
        );

        let items = self.remove_entries(state, playlist, adapter, &tracks, doomed).await;
        Ok(BatchReport::new(playlist.clone(), state.plan_mode(), items))
    }

    /// Removes every track credited to one of `artists` (case-insensitive).
    pub async fn remove_by_artists(
        &self,
        state: &RunState,
        playlist: &PlaylistRef,
        artists: &[String],
    ) -> Result<BatchReport<RemoveItem>> {
        let adapter = self.adapter(playlist.provider)?;
        let wanted: HashSet<String> = artists
            .iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        let tracks = adapter.list_tracks(state, playlist).await?;

        let doomed: Vec<(usize, Option<Track>)> = tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| credited_to_any(t, &wanted))
            .map(|(i, _)| (i, None))
            .collect();
        log::info!("remove_by_artists {}: {} of {} tracks match", playlist, doomed.len(), tracks.len());

        let items = self.remove_entries(state, playlist, adapter, &tracks, doomed).await;
        Ok(BatchReport::new(playlist.clone(), state.plan_mode(), items))
    }

    /// Removes entries highest position first so positions of the remaining
    /// ones stay valid. Items come back in playlist order.
    async fn remove_entries(
        &self,
        state: &RunState,
        playlist: &PlaylistRef,
        adapter: &Arc<dyn Adapter>,
        tracks: &[Track],
        mut doomed: Vec<(usize, Option<Track>)>,
    ) -> Vec<RemoveItem> {
        doomed.sort_by(|a, b| b.0.cmp(&a.0));
        let mut items = Vec::with_capacity(doomed.len());
        for (idx, kept) in doomed {
            let track = tracks[idx].clone();
            let outcome = if state.is_interrupted() {
                RemoveOutcome::Skipped { reason: INTERRUPTED.into() }
            } else {
                match adapter.remove_track(state, playlist, &track).await {
                    Ok(EditOutcome::Applied) => RemoveOutcome::Removed,
                    Ok(EditOutcome::Planned) => RemoveOutcome::Planned,
                    Ok(EditOutcome::NoOp) => RemoveOutcome::AlreadyAbsent,
                    Err(e) => {
                        log::error!("Failed to remove {} from {}: {}", track.display(), playlist, e);
                        RemoveOutcome::Failed { error: e.to_string() }
                    }
                }
            };
            items.push(RemoveItem { track, kept, outcome });
        }
        items.reverse();
        items
    }
}

/// For each track, the index of the first-seen member of its duplicate group.
///
/// Groups are the transitive closure of pairwise duplicate matches.
pub fn duplicate_groups(engine: &SimilarityEngine, tracks: &[Track]) -> Vec<usize> {
    let keys: Vec<NormalizedKey> = tracks.iter().map(|t| t.normalized_key()).collect();
    let mut parent: Vec<usize> = (0..tracks.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..tracks.len() {
        for j in (i + 1)..tracks.len() {
            if !engine.compare_keys(&keys[i], &keys[j], &tracks[j]).is_duplicate {
                continue;
            }
            let (a, b) = (find(&mut parent, i), find(&mut parent, j));
            if a != b {
                // Lower index stays root, so the root is the first-seen member.
                let (root, child) = if a < b { (a, b) } else { (b, a) };
                parent[child] = root;
            }
        }
    }
    (0..tracks.len()).map(|i| find(&mut parent, i)).collect()
}

fn credited_to_any(track: &Track, wanted: &HashSet<String>) -> bool {
    let full = track.artist.trim().to_lowercase();
    if wanted.contains(&full) {
        return true;
    }
    let credited = credited_artists(&full).any(|a| wanted.contains(a));
    credited
}

/// Individual names in a multi-artist credit such as "A, B & C".
fn credited_artists(artist: &str) -> impl Iterator<Item = &str> {
    artist
        .split(|c| c == ',' || c == ';' || c == '&')
        .map(str::trim)
        .filter(|a| !a.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_are_transitive_and_rooted_at_first_seen() {
        let engine = SimilarityEngine::default();
        let tracks = vec![
            Track::new("Song", "Band", "1"),
            Track::new("Other", "Someone", "2"),
            Track::new("Song (Live)", "Band", "3"),
            Track::new("song", "Band feat. X", "4"),
            Track::new("Other", "Someone", "5"),
        ];
        assert_eq!(duplicate_groups(&engine, &tracks), vec![0, 1, 0, 0, 1]);
    }

    #[test]
    fn blank_tracks_never_group() {
        let engine = SimilarityEngine::default();
        let tracks = vec![Track::new("", "", "1"), Track::new("", "", "2")];
        assert_eq!(duplicate_groups(&engine, &tracks), vec![0, 1]);
    }

    #[test]
    fn artist_credit_matching_is_case_insensitive() {
        let wanted: HashSet<String> = ["band".to_string()].into_iter().collect();
        assert!(credited_to_any(&Track::new("x", "BAND", "1"), &wanted));
        assert!(credited_to_any(&Track::new("x", "Other, Band", "1"), &wanted));
        assert!(!credited_to_any(&Track::new("x", "Bandit", "1"), &wanted));
    }
}
