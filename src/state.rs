//! Per-run coordination shared by the manager, adapters and fallback resolver.
//!
//! A `RunState` is built once per run and passed by reference into every
//! operation. Nothing here outlives the process.

use crate::error::Result;
use crate::models::{ProviderKind, Track};
use crate::normalize::NormalizedKey;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

/// Search routing for one provider. The only transition is
/// `Normal -> QuotaExhausted`; there is no way back within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderMode {
    #[default]
    Normal,
    QuotaExhausted,
}

type CacheSlot = Arc<OnceCell<Option<Track>>>;

#[derive(Debug)]
pub struct RunState {
    run_id: Uuid,
    plan_mode: bool,
    modes: Mutex<HashMap<ProviderKind, ProviderMode>>,
    search_cache: Mutex<HashMap<(ProviderKind, String), CacheSlot>>,
    interrupted: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every critical section is a plain map operation; a panic inside one
    // cannot leave the map half-written.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunState {
    pub fn new(plan_mode: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            plan_mode,
            modes: Mutex::new(HashMap::new()),
            search_cache: Mutex::new(HashMap::new()),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Dry-run: destructive calls are logged as planned and skipped.
    pub fn plan_mode(&self) -> bool {
        self.plan_mode
    }

    pub fn mode(&self, provider: ProviderKind) -> ProviderMode {
        lock(&self.modes).get(&provider).copied().unwrap_or_default()
    }

    pub fn is_quota_exhausted(&self, provider: ProviderKind) -> bool {
        self.mode(provider) == ProviderMode::QuotaExhausted
    }

    /// Returns true only for the call that performed the transition.
    pub fn mark_quota_exhausted(&self, provider: ProviderKind) -> bool {
        let mut modes = lock(&self.modes);
        let mode = modes.entry(provider).or_default();
        if *mode == ProviderMode::QuotaExhausted {
            return false;
        }
        *mode = ProviderMode::QuotaExhausted;
        drop(modes);
        warn!(
            run_id = %self.run_id,
            provider = %provider,
            "daily quota exhausted; native search disabled, using web fallback for the rest of the run"
        );
        true
    }

    /// Look `key` up once per provider per run.
    ///
    /// Concurrent callers for the same key wait on the same slot, so at most one
    /// `lookup` runs to completion successfully. Failed lookups leave the slot
    /// empty and the next caller tries again.
    pub async fn cached_search<F, Fut>(&self, provider: ProviderKind, key: &NormalizedKey, lookup: F) -> Result<Option<Track>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Track>>>,
    {
        let slot = {
            let mut cache = lock(&self.search_cache);
            cache
                .entry((provider, key.key()))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        if let Some(hit) = slot.get() {
            debug!(provider = %provider, key = %key, "search cache hit");
            return Ok(hit.clone());
        }
        let value = slot.get_or_try_init(lookup).await?;
        Ok(value.clone())
    }

    /// Populated entry for `key`, if any. Outer `None` means never looked up.
    pub fn cached(&self, provider: ProviderKind, key: &NormalizedKey) -> Option<Option<Track>> {
        lock(&self.search_cache)
            .get(&(provider, key.key()))
            .and_then(|slot| slot.get().cloned())
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::normalize::normalize;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn quota_transition_is_one_way_and_reported_once() {
        let st = RunState::new(false);
        assert_eq!(st.mode(ProviderKind::YouTube), ProviderMode::Normal);
        assert!(st.mark_quota_exhausted(ProviderKind::YouTube));
        assert!(!st.mark_quota_exhausted(ProviderKind::YouTube));
        assert!(st.is_quota_exhausted(ProviderKind::YouTube));
        assert!(!st.is_quota_exhausted(ProviderKind::Spotify));
    }

    #[tokio::test]
    async fn first_lookup_wins_and_later_ones_are_not_run() {
        let st = RunState::new(false);
        let key = normalize("Song", "Band");
        let calls = AtomicUsize::new(0);

        let first = st
            .cached_search(ProviderKind::Spotify, &key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Track::new("Song", "Band", "spotify:track:1")))
            })
            .await
            .unwrap();
        let second = st
            .cached_search(ProviderKind::Spotify, &key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Track::new("Other", "Band", "spotify:track:2")))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(second.unwrap().provider_id, "spotify:track:1");
    }

    #[tokio::test]
    async fn absent_results_are_cached_but_errors_are_not() {
        let st = RunState::new(false);
        let key = normalize("Missing", "Nobody");

        let err = st
            .cached_search(ProviderKind::YouTube, &key, || async { Err(SyncError::Interrupted) })
            .await;
        assert!(err.is_err());
        assert_eq!(st.cached(ProviderKind::YouTube, &key), None);

        let miss = st
            .cached_search(ProviderKind::YouTube, &key, || async { Ok(None) })
            .await
            .unwrap();
        assert!(miss.is_none());
        assert_eq!(st.cached(ProviderKind::YouTube, &key), Some(None));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_for_one_key_run_once() {
        let st = Arc::new(RunState::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let st = st.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let key = normalize("Song", "Band");
                st.cached_search(ProviderKind::Spotify, &key, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(Some(Track::new("Song", "Band", "id")))
                })
                .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap().is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
