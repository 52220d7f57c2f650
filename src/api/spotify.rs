use super::{plan_only, send_json, Adapter, Membership};
use crate::error::{ProviderError, Result, SyncError};
use crate::models::{EditOutcome, PlaylistRef, ProviderKind, Track};
use crate::normalize::NormalizedKey;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::state::RunState;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::env;
use std::time::Duration;

/// Spotify provider backed by the Spotify Web API.
/// Receives an already-authorized bearer token; refreshing it is the caller's job.
/// The endpoint may be overridden by the SPOTIFY_API_BASE env var or `with_api_base`.
pub struct SpotifyAdapter {
    client: Client,
    api_base: String,
    access_token: String,
    policy: RetryPolicy,
    membership: Membership,
}

impl SpotifyAdapter {
    pub fn new(access_token: String, retry: RetryConfig, concurrency_limit: usize) -> Self {
        Self {
            client: Client::new(),
            api_base: Self::default_api_base(),
            access_token,
            policy: RetryPolicy::new(ProviderKind::Spotify, retry, concurrency_limit),
            membership: Membership::default(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn default_api_base() -> String {
        // include v1 path by default
        env::var("SPOTIFY_API_BASE").unwrap_or_else(|_| "https://api.spotify.com/v1".into())
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Accepts bare ids, `spotify:track:` URIs and open.spotify.com links.
    pub fn track_uri(id: &str) -> String {
        let id = id.trim();
        if id.starts_with("spotify:track:") {
            return id.to_string();
        }
        if let Some(parsed) = crate::fallback::parse_spotify_track(id) {
            return parsed;
        }
        format!("spotify:track:{}", id)
    }

    /// Spotify has no daily quota; 429 is the only throttle signal.
    pub fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return ProviderError::RateLimited {
                retry_after,
                message: format!("spotify 429: {}", body),
            };
        }
        if status.is_server_error() {
            return ProviderError::Transient(format!("spotify {}: {}", status, body));
        }
        if status == StatusCode::UNAUTHORIZED {
            return ProviderError::Fatal(format!("spotify 401 (token expired or revoked): {}", body));
        }
        ProviderError::Fatal(format!("spotify {}: {}", status, body))
    }

    fn track_from_json(v: &serde_json::Value) -> Option<Track> {
        let uri = v["uri"].as_str()?;
        let artists: Vec<&str> = v["artists"]
            .as_array()
            .map(|a| a.iter().filter_map(|x| x["name"].as_str()).collect())
            .unwrap_or_default();
        Some(Track::new(v["name"].as_str().unwrap_or(""), artists.join(", "), uri))
    }

    fn position(entry: &Track) -> Option<usize> {
        entry.entry_id.as_deref().and_then(|p| p.parse::<usize>().ok())
    }

    async fn ensure_membership(&self, state: &RunState, playlist: &PlaylistRef) -> Result<()> {
        if !self.membership.is_known(&playlist.playlist_id).await {
            self.list_tracks(state, playlist).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Adapter for SpotifyAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Spotify
    }

    async fn list_tracks(&self, state: &RunState, playlist: &PlaylistRef) -> Result<Vec<Track>> {
        let mut tracks = Vec::new();
        let mut next: Option<String> = Some(format!(
            "{}/playlists/{}/tracks?fields=items(track(uri,name,is_local,artists(name))),next&limit=100",
            self.api_base, playlist.playlist_id
        ));

        // Playlist slot of the next raw item; skipped items still occupy one.
        let mut position = 0usize;
        while let Some(url) = next {
            let page = send_json(
                &self.policy,
                state,
                "list playlist tracks",
                || self.client.get(&url).header(AUTHORIZATION, self.bearer()),
                &[],
                Self::classify,
            )
            .await?
            .unwrap_or_default();
            if let Some(items) = page["items"].as_array() {
                for it in items {
                    let pos = position;
                    position += 1;
                    let t = &it["track"];
                    if t.is_null() || t["is_local"].as_bool().unwrap_or(false) {
                        continue;
                    }
                    if let Some(track) = Self::track_from_json(t) {
                        tracks.push(track.with_entry_id(pos.to_string()));
                    }
                }
            }
            next = page["next"].as_str().map(|s| s.to_string());
        }

        debug!("spotify: {} entries in {}", tracks.len(), playlist.playlist_id);
        self.membership.record_listing(&playlist.playlist_id, &tracks).await;
        Ok(tracks)
    }

    async fn search_track(&self, state: &RunState, query: &NormalizedKey) -> Result<Option<Track>> {
        if state.is_quota_exhausted(ProviderKind::Spotify) {
            return Err(SyncError::QuotaExhausted { provider: ProviderKind::Spotify });
        }
        let q = if query.artist.is_empty() {
            format!("track:{}", query.title)
        } else {
            format!("track:{} artist:{}", query.title, query.artist)
        };
        let url = format!("{}/search?q={}&type=track&limit=1", self.api_base, urlencoding::encode(&q));
        let j = send_json(
            &self.policy,
            state,
            "search track",
            || {
                self.client
                    .get(&url)
                    .header(AUTHORIZATION, self.bearer())
                    .header(ACCEPT, "application/json")
            },
            &[],
            Self::classify,
        )
        .await?
        .unwrap_or_default();
        Ok(j["tracks"]["items"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(Self::track_from_json))
    }

    async fn add_track(&self, state: &RunState, playlist: &PlaylistRef, provider_id: &str) -> Result<EditOutcome> {
        let uri = Self::track_uri(provider_id);
        self.ensure_membership(state, playlist).await?;
        if self.membership.contains(&playlist.playlist_id, &uri).await {
            debug!("spotify: {} already in {}", uri, playlist.playlist_id);
            return Ok(EditOutcome::NoOp);
        }
        if let Some(planned) = plan_only(state, ProviderKind::Spotify, "add", playlist, &uri) {
            return Ok(planned);
        }

        let url = format!("{}/playlists/{}/tracks", self.api_base, playlist.playlist_id);
        let body = json!({ "uris": [uri.as_str()] });
        send_json(
            &self.policy,
            state,
            "add track",
            || self.client.post(&url).header(AUTHORIZATION, self.bearer()).json(&body),
            &[],
            Self::classify,
        )
        .await?;

        info!("spotify: added {} to {}", uri, playlist.playlist_id);
        self.membership.push(&playlist.playlist_id, Track::new("", "", uri)).await;
        Ok(EditOutcome::Applied)
    }

    async fn remove_track(&self, state: &RunState, playlist: &PlaylistRef, entry: &Track) -> Result<EditOutcome> {
        let uri = Self::track_uri(&entry.provider_id);
        self.ensure_membership(state, playlist).await?;
        let lookup = Track { provider_id: uri.clone(), ..entry.clone() };
        let mut found = match self.membership.find(&playlist.playlist_id, &lookup).await {
            Some(t) => t,
            None => {
                debug!("spotify: {} not in {}, nothing to remove", uri, playlist.playlist_id);
                return Ok(EditOutcome::NoOp);
            }
        };
        if Self::position(&found).is_none() {
            // Added during this run, so its slot is unknown until relisted.
            self.list_tracks(state, playlist).await?;
            found = match self.membership.find(&playlist.playlist_id, &Track { entry_id: None, ..lookup.clone() }).await {
                Some(t) => t,
                None => return Ok(EditOutcome::NoOp),
            };
        }
        let pos = Self::position(&found).ok_or_else(|| {
            SyncError::fatal(ProviderKind::Spotify, format!("no playlist position for {}", uri))
        })?;
        if let Some(planned) = plan_only(state, ProviderKind::Spotify, "remove", playlist, &uri) {
            return Ok(planned);
        }

        // Removing by position keeps other occurrences of the same URI.
        let url = format!("{}/playlists/{}/tracks", self.api_base, playlist.playlist_id);
        let body = json!({ "tracks": [{ "uri": uri.as_str(), "positions": [pos] }] });
        send_json(
            &self.policy,
            state,
            "remove track",
            || self.client.delete(&url).header(AUTHORIZATION, self.bearer()).json(&body),
            &[],
            Self::classify,
        )
        .await?;

        info!("spotify: removed {} at {} from {}", uri, pos, playlist.playlist_id);
        self.membership.remove_position(&playlist.playlist_id, pos).await;
        Ok(EditOutcome::Applied)
    }
}
