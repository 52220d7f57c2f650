pub mod mock;
pub mod spotify;
pub mod youtube;

use crate::error::{ProviderError, Result};
use crate::models::{EditOutcome, PlaylistRef, ProviderKind, Track};
use crate::normalize::NormalizedKey;
use crate::retry::RetryPolicy;
use crate::state::RunState;
use log::info;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, StatusCode};
use std::collections::HashMap;
use std::time::Duration;

/// Adapter contract: the four operations the reconciliation manager needs from
/// a catalog provider. Implementations: spotify::SpotifyAdapter,
/// youtube::YouTubeAdapter and mock::MockAdapter.
///
/// Every remote call goes through the adapter's `RetryPolicy`. `add_track` and
/// `remove_track` are idempotent and return `EditOutcome::Planned` without
/// touching the provider when the run is in plan mode.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Every entry of the playlist in provider order, all pages fetched.
    async fn list_tracks(&self, state: &RunState, playlist: &PlaylistRef) -> Result<Vec<Track>>;

    /// Native catalog search. Fails with `SyncError::QuotaExhausted` without a
    /// network call once the provider is in quota-exhausted mode.
    async fn search_track(&self, state: &RunState, query: &NormalizedKey) -> Result<Option<Track>>;

    async fn add_track(&self, state: &RunState, playlist: &PlaylistRef, provider_id: &str) -> Result<EditOutcome>;

    /// Removes one playlist entry. `entry.entry_id` selects the occurrence when
    /// the provider has one; otherwise the first entry with `entry.provider_id`.
    async fn remove_track(&self, state: &RunState, playlist: &PlaylistRef, entry: &Track) -> Result<EditOutcome>;
}

/// Last known entries per playlist, kept so add/remove can check before acting.
#[derive(Debug, Default)]
pub struct Membership {
    entries: tokio::sync::Mutex<HashMap<String, Vec<Track>>>,
}

impl Membership {
    pub async fn record_listing(&self, playlist_id: &str, tracks: &[Track]) {
        self.entries.lock().await.insert(playlist_id.to_string(), tracks.to_vec());
    }

    pub async fn is_known(&self, playlist_id: &str) -> bool {
        self.entries.lock().await.contains_key(playlist_id)
    }

    pub async fn contains(&self, playlist_id: &str, provider_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(playlist_id)
            .map(|v| v.iter().any(|t| t.provider_id == provider_id))
            .unwrap_or(false)
    }

    /// The stored entry matching `entry`, by entry id when present.
    pub async fn find(&self, playlist_id: &str, entry: &Track) -> Option<Track> {
        let guard = self.entries.lock().await;
        let list = guard.get(playlist_id)?;
        match &entry.entry_id {
            Some(eid) => list.iter().find(|t| t.entry_id.as_deref() == Some(eid.as_str())).cloned(),
            None => list.iter().find(|t| t.provider_id == entry.provider_id).cloned(),
        }
    }

    pub async fn push(&self, playlist_id: &str, track: Track) {
        self.entries
            .lock()
            .await
            .entry(playlist_id.to_string())
            .or_default()
            .push(track);
    }

    /// Drops the entry at a numeric position and moves later entries up one
    /// slot, as the provider does.
    pub async fn remove_position(&self, playlist_id: &str, position: usize) {
        if let Some(list) = self.entries.lock().await.get_mut(playlist_id) {
            list.retain(|t| t.entry_id.as_deref().and_then(|p| p.parse::<usize>().ok()) != Some(position));
            for t in list.iter_mut() {
                if let Some(p) = t.entry_id.as_deref().and_then(|p| p.parse::<usize>().ok()) {
                    if p > position {
                        t.entry_id = Some((p - 1).to_string());
                    }
                }
            }
        }
    }

    pub async fn remove(&self, playlist_id: &str, entry: &Track) {
        if let Some(list) = self.entries.lock().await.get_mut(playlist_id) {
            let pos = match &entry.entry_id {
                Some(eid) => list.iter().position(|t| t.entry_id.as_deref() == Some(eid.as_str())),
                None => list.iter().position(|t| t.provider_id == entry.provider_id),
            };
            if let Some(i) = pos {
                list.remove(i);
            }
        }
    }
}

/// Plan-mode short circuit shared by all adapters.
pub fn plan_only(state: &RunState, provider: ProviderKind, action: &str, playlist: &PlaylistRef, id: &str) -> Option<EditOutcome> {
    if state.plan_mode() {
        info!("plan: would {} {} on {} ({})", action, id, playlist, provider);
        Some(EditOutcome::Planned)
    } else {
        None
    }
}

pub fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps a non-success response onto the retry taxonomy.
pub type Classifier = fn(StatusCode, Option<Duration>, &str) -> ProviderError;

/// Send a request built by `build` under `policy`. Statuses in `tolerated`
/// yield `Ok(None)`; a successful empty body yields `Some(Value::Null)`.
pub async fn send_json<B>(
    policy: &RetryPolicy,
    state: &RunState,
    what: &str,
    build: B,
    tolerated: &[StatusCode],
    classify: Classifier,
) -> Result<Option<serde_json::Value>>
where
    B: Fn() -> RequestBuilder + Send + Sync,
{
    policy
        .execute(state, what, || {
            let req = build();
            async move {
                let resp = req.send().await.map_err(|e| ProviderError::from_transport(&e))?;
                let status = resp.status();
                if tolerated.contains(&status) {
                    return Ok(None);
                }
                if !status.is_success() {
                    let after = retry_after(&resp);
                    let body = resp.text().await.unwrap_or_default();
                    return Err(classify(status, after, &body));
                }
                let text = resp.text().await.map_err(|e| ProviderError::from_transport(&e))?;
                if text.trim().is_empty() {
                    return Ok(Some(serde_json::Value::Null));
                }
                serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|e| ProviderError::Fatal(format!("{}: undecodable response: {}", what, e)))
            }
        })
        .await
}
