use super::{plan_only, Adapter};
use crate::error::{ProviderError, Result, SyncError};
use crate::models::{EditOutcome, PlaylistRef, ProviderKind, Track};
use crate::normalize::NormalizedKey;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::similarity::score_keys;
use crate::state::RunState;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// In-memory provider used in tests and dry runs without credentials.
///
/// Holds playlists and a searchable catalog, and can be scripted to fail:
/// queued search errors are returned (through the retry policy) before any
/// real answer, and ids in `failing_ids` make add/remove fail fatally.
pub struct MockAdapter {
    kind: ProviderKind,
    policy: RetryPolicy,
    playlists: Mutex<HashMap<String, Vec<Track>>>,
    catalog: Vec<Track>,
    search_errors: Mutex<VecDeque<ProviderError>>,
    failing_ids: Mutex<HashSet<String>>,
    native_searches: AtomicUsize,
    applied_edits: AtomicUsize,
    next_entry: AtomicUsize,
}

impl MockAdapter {
    pub fn new(kind: ProviderKind) -> Self {
        let retry = RetryConfig::new()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(10))
            .with_jitter(false);
        Self {
            kind,
            policy: RetryPolicy::new(kind, retry, 4),
            playlists: Mutex::new(HashMap::new()),
            catalog: Vec::new(),
            search_errors: Mutex::new(VecDeque::new()),
            failing_ids: Mutex::new(HashSet::new()),
            native_searches: AtomicUsize::new(0),
            applied_edits: AtomicUsize::new(0),
            next_entry: AtomicUsize::new(0),
        }
    }

    pub fn with_playlist(self, playlist_id: &str, tracks: Vec<Track>) -> Self {
        let entries: Vec<Track> = tracks.into_iter().map(|t| self.entry(t)).collect();
        self.lock_playlists().insert(playlist_id.to_string(), entries);
        self
    }

    pub fn with_catalog(mut self, catalog: Vec<Track>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn push_search_error(&self, err: ProviderError) {
        self.search_errors.lock().unwrap_or_else(|p| p.into_inner()).push_back(err);
    }

    pub fn fail_edits_for(&self, provider_id: &str) {
        self.failing_ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(provider_id.to_string());
    }

    /// Search attempts that reached the native search (including failed ones).
    pub fn native_searches(&self) -> usize {
        self.native_searches.load(Ordering::SeqCst)
    }

    pub fn applied_edits(&self) -> usize {
        self.applied_edits.load(Ordering::SeqCst)
    }

    pub fn playlist(&self, playlist_id: &str) -> Vec<Track> {
        self.lock_playlists().get(playlist_id).cloned().unwrap_or_default()
    }

    fn lock_playlists(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Track>>> {
        self.playlists.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn entry(&self, track: Track) -> Track {
        if track.entry_id.is_some() {
            return track;
        }
        let n = self.next_entry.fetch_add(1, Ordering::SeqCst);
        track.with_entry_id(format!("{}-entry-{}", self.kind, n))
    }

    fn check_failing(&self, provider_id: &str) -> Result<()> {
        if self
            .failing_ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(provider_id)
        {
            return Err(SyncError::fatal(self.kind, format!("scripted failure for {}", provider_id)));
        }
        Ok(())
    }

    fn best_catalog_match(&self, query: &NormalizedKey) -> Option<Track> {
        self.catalog
            .iter()
            .map(|t| (score_keys(query, &t.normalized_key()), t))
            .filter(|(s, _)| *s >= 0.8)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, t)| t.clone())
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn list_tracks(&self, _state: &RunState, playlist: &PlaylistRef) -> Result<Vec<Track>> {
        self.lock_playlists()
            .get(&playlist.playlist_id)
            .cloned()
            .ok_or_else(|| SyncError::fatal(self.kind, format!("playlist {} not found", playlist.playlist_id)))
    }

    async fn search_track(&self, state: &RunState, query: &NormalizedKey) -> Result<Option<Track>> {
        if state.is_quota_exhausted(self.kind) {
            return Err(SyncError::QuotaExhausted { provider: self.kind });
        }
        self.policy
            .execute(state, "mock search", || {
                self.native_searches.fetch_add(1, Ordering::SeqCst);
                let scripted = self
                    .search_errors
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .pop_front();
                let found = self.best_catalog_match(query);
                async move {
                    match scripted {
                        Some(err) => Err(err),
                        None => Ok(found),
                    }
                }
            })
            .await
    }

    async fn add_track(&self, state: &RunState, playlist: &PlaylistRef, provider_id: &str) -> Result<EditOutcome> {
        let known = self
            .lock_playlists()
            .get(&playlist.playlist_id)
            .map(|v| v.iter().any(|t| t.provider_id == provider_id));
        match known {
            None => return Err(SyncError::fatal(self.kind, format!("playlist {} not found", playlist.playlist_id))),
            Some(true) => return Ok(EditOutcome::NoOp),
            Some(false) => {}
        }
        if let Some(planned) = plan_only(state, self.kind, "add", playlist, provider_id) {
            return Ok(planned);
        }
        self.check_failing(provider_id)?;

        let catalog_entry = self
            .catalog
            .iter()
            .find(|t| t.provider_id == provider_id)
            .cloned()
            .unwrap_or_else(|| Track::new("", "", provider_id));
        let entry = self.entry(Track { entry_id: None, ..catalog_entry });
        self.lock_playlists()
            .entry(playlist.playlist_id.clone())
            .or_default()
            .push(entry);
        self.applied_edits.fetch_add(1, Ordering::SeqCst);
        info!(provider = %self.kind, playlist = %playlist.playlist_id, provider_id, "mock add");
        Ok(EditOutcome::Applied)
    }

    async fn remove_track(&self, state: &RunState, playlist: &PlaylistRef, entry: &Track) -> Result<EditOutcome> {
        let find = |list: &Vec<Track>| match &entry.entry_id {
            Some(eid) => list.iter().position(|t| t.entry_id.as_deref() == Some(eid.as_str())),
            None => list.iter().position(|t| t.provider_id == entry.provider_id),
        };
        let present = {
            let playlists = self.lock_playlists();
            let list = playlists
                .get(&playlist.playlist_id)
                .ok_or_else(|| SyncError::fatal(self.kind, format!("playlist {} not found", playlist.playlist_id)))?;
            find(list).is_some()
        };
        if !present {
            return Ok(EditOutcome::NoOp);
        }
        if let Some(planned) = plan_only(state, self.kind, "remove", playlist, &entry.provider_id) {
            return Ok(planned);
        }
        self.check_failing(&entry.provider_id)?;

        let removed = {
            let mut playlists = self.lock_playlists();
            match playlists.get_mut(&playlist.playlist_id) {
                Some(list) => match find(list) {
                    Some(i) => {
                        list.remove(i);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if !removed {
            return Ok(EditOutcome::NoOp);
        }
        self.applied_edits.fetch_add(1, Ordering::SeqCst);
        info!(provider = %self.kind, playlist = %playlist.playlist_id, provider_id = %entry.provider_id, "mock remove");
        Ok(EditOutcome::Applied)
    }
}
