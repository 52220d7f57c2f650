use super::{plan_only, send_json, Adapter, Membership};
use crate::error::{ProviderError, Result, SyncError};
use crate::models::{EditOutcome, PlaylistRef, ProviderKind, Track};
use crate::normalize::NormalizedKey;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::state::RunState;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::env;
use std::time::Duration;

/// YouTube provider backed by the YouTube Data API v3.
///
/// Searches cost 100 quota units each, so this is the provider that usually
/// hits its daily quota first; the API reports that as a 403 whose error
/// reason is `quotaExceeded`, distinct from `rateLimitExceeded`.
/// The endpoint may be overridden by the YOUTUBE_API_BASE env var or `with_api_base`.
pub struct YouTubeAdapter {
    client: Client,
    api_base: String,
    access_token: String,
    policy: RetryPolicy,
    membership: Membership,
}

impl YouTubeAdapter {
    pub fn new(access_token: String, retry: RetryConfig, concurrency_limit: usize) -> Self {
        Self {
            client: Client::new(),
            api_base: Self::default_api_base(),
            access_token,
            policy: RetryPolicy::new(ProviderKind::YouTube, retry, concurrency_limit),
            membership: Membership::default(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn default_api_base() -> String {
        env::var("YOUTUBE_API_BASE").unwrap_or_else(|_| "https://www.googleapis.com/youtube/v3".into())
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    pub fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
        let lowered = body.to_lowercase();
        if status == StatusCode::FORBIDDEN {
            if lowered.contains("quotaexceeded") || (lowered.contains("quota") && lowered.contains("exceeded")) {
                return ProviderError::QuotaExhausted(format!("youtube 403: {}", body));
            }
            if lowered.contains("ratelimitexceeded") || lowered.contains("rate limit") {
                return ProviderError::RateLimited {
                    retry_after,
                    message: format!("youtube 403: {}", body),
                };
            }
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return ProviderError::RateLimited {
                retry_after,
                message: format!("youtube 429: {}", body),
            };
        }
        if status.is_server_error() {
            return ProviderError::Transient(format!("youtube {}: {}", status, body));
        }
        ProviderError::Fatal(format!("youtube {}: {}", status, body))
    }

    /// Owner channel of the video, falling back to the channel that added it.
    fn item_to_track(item: &serde_json::Value) -> Option<Track> {
        let snippet = &item["snippet"];
        let video_id = snippet["resourceId"]["videoId"].as_str()?;
        let artist = snippet["videoOwnerChannelTitle"]
            .as_str()
            .or_else(|| snippet["channelTitle"].as_str())
            .unwrap_or("");
        let mut track = Track::new(snippet["title"].as_str().unwrap_or(""), artist, video_id);
        if let Some(id) = item["id"].as_str() {
            track = track.with_entry_id(id);
        }
        Some(track)
    }

    async fn ensure_membership(&self, state: &RunState, playlist: &PlaylistRef) -> Result<()> {
        if !self.membership.is_known(&playlist.playlist_id).await {
            self.list_tracks(state, playlist).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Adapter for YouTubeAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::YouTube
    }

    async fn list_tracks(&self, state: &RunState, playlist: &PlaylistRef) -> Result<Vec<Track>> {
        let mut tracks = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/playlistItems?part=snippet&maxResults=50&playlistId={}",
                self.api_base,
                urlencoding::encode(&playlist.playlist_id)
            );
            if let Some(tok) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(tok)));
            }
            let page = send_json(
                &self.policy,
                state,
                "list playlist items",
                || self.client.get(&url).header(AUTHORIZATION, self.bearer()),
                &[],
                Self::classify,
            )
            .await?
            .unwrap_or_default();
            if let Some(items) = page["items"].as_array() {
                tracks.extend(items.iter().filter_map(Self::item_to_track));
            }
            page_token = page["nextPageToken"].as_str().map(|s| s.to_string());
            if page_token.is_none() {
                break;
            }
        }

        debug!("youtube: {} entries in {}", tracks.len(), playlist.playlist_id);
        self.membership.record_listing(&playlist.playlist_id, &tracks).await;
        Ok(tracks)
    }

    async fn search_track(&self, state: &RunState, query: &NormalizedKey) -> Result<Option<Track>> {
        if state.is_quota_exhausted(ProviderKind::YouTube) {
            return Err(SyncError::QuotaExhausted { provider: ProviderKind::YouTube });
        }
        let url = format!(
            "{}/search?part=snippet&type=video&maxResults=1&q={}",
            self.api_base,
            urlencoding::encode(&query.query())
        );
        let j = send_json(
            &self.policy,
            state,
            "search video",
            || self.client.get(&url).header(AUTHORIZATION, self.bearer()),
            &[],
            Self::classify,
        )
        .await?
        .unwrap_or_default();
        let first = match j["items"].as_array().and_then(|a| a.first()) {
            Some(f) => f,
            None => return Ok(None),
        };
        let video_id = match first["id"]["videoId"].as_str() {
            Some(v) => v,
            None => return Ok(None),
        };
        let snippet = &first["snippet"];
        Ok(Some(Track::new(
            snippet["title"].as_str().unwrap_or(""),
            snippet["channelTitle"].as_str().unwrap_or(""),
            video_id,
        )))
    }

    async fn add_track(&self, state: &RunState, playlist: &PlaylistRef, provider_id: &str) -> Result<EditOutcome> {
        self.ensure_membership(state, playlist).await?;
        if self.membership.contains(&playlist.playlist_id, provider_id).await {
            debug!("youtube: {} already in {}", provider_id, playlist.playlist_id);
            return Ok(EditOutcome::NoOp);
        }
        if let Some(planned) = plan_only(state, ProviderKind::YouTube, "add", playlist, provider_id) {
            return Ok(planned);
        }

        let url = format!("{}/playlistItems?part=snippet", self.api_base);
        let body = json!({
            "snippet": {
                "playlistId": playlist.playlist_id,
                "resourceId": { "kind": "youtube#video", "videoId": provider_id }
            }
        });
        let created = send_json(
            &self.policy,
            state,
            "insert playlist item",
            || self.client.post(&url).header(AUTHORIZATION, self.bearer()).json(&body),
            &[StatusCode::CONFLICT],
            Self::classify,
        )
        .await?;

        let created = match created {
            Some(v) => v,
            None => {
                debug!("youtube: provider reports {} already in {}", provider_id, playlist.playlist_id);
                return Ok(EditOutcome::NoOp);
            }
        };
        info!("youtube: added {} to {}", provider_id, playlist.playlist_id);
        let mut entry = Track::new("", "", provider_id);
        if let Some(id) = created["id"].as_str() {
            entry = entry.with_entry_id(id);
        }
        self.membership.push(&playlist.playlist_id, entry).await;
        Ok(EditOutcome::Applied)
    }

    async fn remove_track(&self, state: &RunState, playlist: &PlaylistRef, entry: &Track) -> Result<EditOutcome> {
        self.ensure_membership(state, playlist).await?;
        let target = match self.membership.find(&playlist.playlist_id, entry).await {
            Some(t) => t,
            None => {
                debug!("youtube: {} not in {}, nothing to remove", entry.provider_id, playlist.playlist_id);
                return Ok(EditOutcome::NoOp);
            }
        };
        let item_id = match target.entry_id.clone() {
            Some(id) => id,
            None => {
                return Err(SyncError::fatal(
                    ProviderKind::YouTube,
                    format!("no playlist item id for video {}", entry.provider_id),
                ))
            }
        };
        if let Some(planned) = plan_only(state, ProviderKind::YouTube, "remove", playlist, &entry.provider_id) {
            return Ok(planned);
        }

        let url = format!("{}/playlistItems?id={}", self.api_base, urlencoding::encode(&item_id));
        let deleted = send_json(
            &self.policy,
            state,
            "delete playlist item",
            || self.client.delete(&url).header(AUTHORIZATION, self.bearer()),
            &[StatusCode::NOT_FOUND],
            Self::classify,
        )
        .await?;

        self.membership.remove(&playlist.playlist_id, &target).await;
        if deleted.is_none() {
            return Ok(EditOutcome::NoOp);
        }
        info!("youtube: removed {} from {}", entry.provider_id, playlist.playlist_id);
        Ok(EditOutcome::Applied)
    }
}
