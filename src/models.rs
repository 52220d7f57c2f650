use crate::normalize::{normalize, NormalizedKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two remote catalogs kept in sync. Spotify is provider A, YouTube is provider B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Spotify,
    YouTube,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Spotify => "spotify",
            ProviderKind::YouTube => "youtube",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spotify" | "a" => Ok(ProviderKind::Spotify),
            "youtube" | "yt" | "b" => Ok(ProviderKind::YouTube),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// A single playlist entry as reported by a provider.
///
/// `provider_id` is the catalog identifier (Spotify URI, YouTube video id).
/// `entry_id` identifies this particular occurrence inside a playlist when the
/// provider has such a handle (YouTube playlist item id, Spotify position).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    pub artist: String,
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
}

impl Track {
    pub fn new(title: impl Into<String>, artist: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            provider_id: provider_id.into(),
            entry_id: None,
        }
    }

    pub fn with_entry_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }

    /// Computed on demand; depends only on title and artist.
    pub fn normalized_key(&self) -> NormalizedKey {
        normalize(&self.title, &self.artist)
    }

    pub fn display(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.title, self.artist)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaylistRef {
    pub provider: ProviderKind,
    pub playlist_id: String,
}

impl PlaylistRef {
    pub fn new(provider: ProviderKind, playlist_id: impl Into<String>) -> Self {
        Self { provider, playlist_id: playlist_id.into() }
    }
}

impl fmt::Display for PlaylistRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.playlist_id)
    }
}

impl FromStr for PlaylistRef {
    type Err = String;

    /// Parses `provider:playlist_id`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected provider:playlist_id, got '{}'", s))?;
        if id.trim().is_empty() {
            return Err(format!("empty playlist id in '{}'", s));
        }
        Ok(PlaylistRef::new(provider.parse()?, id.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub score: f64,
    pub is_duplicate: bool,
    pub matched_track: Option<Track>,
}

/// What an add/remove call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOutcome {
    Applied,
    /// Add of an already-present track, or remove of an absent one.
    NoOp,
    /// Plan mode: logged, not executed.
    Planned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialFailure,
    Failure,
}

/// Per-item results plus an overall status.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport<T> {
    pub playlist: PlaylistRef,
    pub plan_mode: bool,
    pub items: Vec<T>,
    pub status: BatchStatus,
}

impl<T: ItemResult> BatchReport<T> {
    pub fn new(playlist: PlaylistRef, plan_mode: bool, items: Vec<T>) -> Self {
        let failed = items.iter().filter(|i| i.is_failure()).count();
        let status = if failed == 0 {
            BatchStatus::Success
        } else if failed == items.len() {
            BatchStatus::Failure
        } else {
            BatchStatus::PartialFailure
        };
        Self { playlist, plan_mode, items, status }
    }

    pub fn failures(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter(|i| i.is_failure())
    }
}

pub trait ItemResult {
    fn is_failure(&self) -> bool;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AddOutcome {
    /// Destination already holds a duplicate of the source track.
    AlreadyPresent { matched: Track, score: f64 },
    Added { resolved: Track, via_fallback: bool },
    Planned { resolved: Track, via_fallback: bool },
    /// Nothing resolvable on the destination; reported, not an error.
    NoMatch,
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AddItem {
    pub source: Track,
    #[serde(flatten)]
    pub outcome: AddOutcome,
}

impl ItemResult for AddItem {
    fn is_failure(&self) -> bool {
        matches!(self.outcome, AddOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemoveOutcome {
    Removed,
    Planned,
    AlreadyAbsent,
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveItem {
    pub track: Track,
    /// The retained representative when removed as a duplicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kept: Option<Track>,
    #[serde(flatten)]
    pub outcome: RemoveOutcome,
}

impl ItemResult for RemoveItem {
    fn is_failure(&self) -> bool {
        matches!(self.outcome, RemoveOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtistCount {
    pub artist: String,
    pub count: usize,
}

/// Track counts per artist, most frequent first.
#[derive(Debug, Clone, Serialize)]
pub struct ArtistSummary {
    pub playlist: PlaylistRef,
    pub total_tracks: usize,
    pub artists: Vec<ArtistCount>,
}

impl ArtistSummary {
    pub fn count_for(&self, artist: &str) -> usize {
        self.artists
            .iter()
            .find(|a| a.artist == artist)
            .map(|a| a.count)
            .unwrap_or(0)
    }
}
