#![forbid(unsafe_code)]

//! In-memory channel avatar cache.
//!
//! Avatars are nice to have but never worth delaying a feed cycle for, so
//! they are fetched fire-and-forget in the background, bounded by a small
//! semaphore, with a pending set to stop the same channel from being fetched
//! twice at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::invidious::{InvidiousClient, resolve_instance_url};
use crate::settings::SettingsStore;
use crate::store::{Thumbnail, quality_for_width};

/// Concurrent background avatar fetches.
const MAX_CONCURRENT_FETCHES: usize = 5;

/// Entries held before the oldest tenth is evicted.
const MAX_ENTRIES: usize = 10_000;

struct CachedAvatar {
    thumbnails: Vec<Thumbnail>,
    cached_at: Instant,
}

pub struct AvatarCache {
    settings: Arc<SettingsStore>,
    invidious: Arc<InvidiousClient>,
    entries: Mutex<HashMap<String, CachedAvatar>>,
    pending: Mutex<HashSet<String>>,
    gate: Arc<Semaphore>,
    capacity: usize,
}

impl AvatarCache {
    pub fn new(settings: Arc<SettingsStore>, invidious: Arc<InvidiousClient>) -> Self {
        Self::with_capacity(settings, invidious, MAX_ENTRIES)
    }

    fn with_capacity(
        settings: Arc<SettingsStore>,
        invidious: Arc<InvidiousClient>,
        capacity: usize,
    ) -> Self {
        Self {
            settings,
            invidious,
            entries: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            gate: Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES)),
            capacity,
        }
    }

    /// Returns the cached avatar set for a channel if it is still fresh.
    pub fn get(&self, channel_id: &str) -> Option<Vec<Thumbnail>> {
        let ttl = self.settings.get().cache_avatar_ttl;
        let entries = self.entries.lock();
        let entry = entries.get(channel_id)?;
        if entry.cached_at.elapsed().as_secs() >= ttl {
            return None;
        }
        Some(entry.thumbnails.clone())
    }

    /// Fetches a channel's avatars from the primary backend and caches them.
    /// Relative URLs are resolved against the configured instance.
    pub async fn fetch_and_cache(&self, channel_id: &str) -> Option<Vec<Thumbnail>> {
        {
            let mut pending = self.pending.lock();
            if !pending.insert(channel_id.to_string()) {
                return None;
            }
        }
        let result = self.fetch_thumbnails(channel_id).await;
        self.pending.lock().remove(channel_id);

        let thumbnails = result?;
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            evict_oldest(&mut entries);
        }
        entries.insert(
            channel_id.to_string(),
            CachedAvatar {
                thumbnails: thumbnails.clone(),
                cached_at: Instant::now(),
            },
        );
        Some(thumbnails)
    }

    async fn fetch_thumbnails(&self, channel_id: &str) -> Option<Vec<Thumbnail>> {
        let base = self.settings.get().invidious_instance?;
        let channel = match self.invidious.get_channel(channel_id).await {
            Ok(channel) => channel?,
            Err(err) => {
                warn!(channel_id, %err, "avatar fetch failed");
                return None;
            }
        };
        let thumbnails: Vec<Thumbnail> = channel
            .author_thumbnails
            .into_iter()
            .filter_map(|thumb| {
                let url = thumb.url?;
                Some(Thumbnail {
                    quality: quality_for_width(thumb.width).to_string(),
                    url: resolve_instance_url(&base, &url),
                    width: thumb.width,
                    height: thumb.height,
                })
            })
            .collect();
        if thumbnails.is_empty() {
            return None;
        }
        Some(thumbnails)
    }

    /// Spawns a background fetch for a channel unless the backend is off, a
    /// fresh entry exists, or a fetch is already underway.
    pub fn schedule_background_fetch(self: &Arc<Self>, channel_id: &str) {
        let settings = self.settings.get();
        if !settings.invidious_enabled || settings.invidious_instance.is_none() {
            return;
        }
        if self.get(channel_id).is_some() || self.pending.lock().contains(channel_id) {
            return;
        }

        let cache = Arc::clone(self);
        let gate = Arc::clone(&self.gate);
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = gate.acquire().await else {
                return;
            };
            if cache.fetch_and_cache(&channel_id).await.is_some() {
                debug!(channel_id = %channel_id, "avatar cached");
            }
        });
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    fn seed_entry(&self, channel_id: &str, cached_at: Instant) {
        self.entries.lock().insert(
            channel_id.to_string(),
            CachedAvatar {
                thumbnails: Vec::new(),
                cached_at,
            },
        );
    }

    /// Drops entries past the TTL. Called from the ingestion loop between
    /// cycles.
    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.settings.get().cache_avatar_ttl;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.cached_at.elapsed().as_secs() < ttl);
        before - entries.len()
    }
}

/// Removes the oldest tenth of the entries (at least one).
fn evict_oldest(entries: &mut HashMap<String, CachedAvatar>) {
    let to_remove = (entries.len() / 10).max(1);
    let mut by_age: Vec<(String, Instant)> = entries
        .iter()
        .map(|(id, entry)| (id.clone(), entry.cached_at))
        .collect();
    by_age.sort_by_key(|&(_, cached_at)| cached_at);
    for (id, _) in by_age.into_iter().take(to_remove) {
        entries.remove(&id);
    }
    debug!(removed = to_remove, "avatar cache at capacity, evicted oldest entries");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tempfile::tempdir;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn cache_for(instance: Option<String>, ttl: u64) -> Arc<AvatarCache> {
        let dir = tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")));
        let mut s = settings.get();
        s.invidious_instance = instance;
        s.cache_avatar_ttl = ttl;
        settings.update(s).unwrap();
        let invidious = Arc::new(InvidiousClient::new(settings.clone()));
        Arc::new(AvatarCache::new(settings, invidious))
    }

    fn avatar_router() -> Router {
        Router::new().route(
            "/api/v1/channels/UCabc",
            get(|| async {
                Json(json!({
                    "author": "Channel",
                    "authorThumbnails": [
                        {"url": "/ggpht/small.jpg", "width": 48, "height": 48},
                        {"url": "/ggpht/big.jpg", "width": 512, "height": 512}
                    ]
                }))
            }),
        )
    }

    #[tokio::test]
    async fn fetches_and_resolves_relative_urls() {
        let base = serve(avatar_router()).await;
        let cache = cache_for(Some(base.clone()), 60);

        let thumbs = cache.fetch_and_cache("UCabc").await.expect("avatars fetched");
        assert_eq!(thumbs.len(), 2);
        assert_eq!(thumbs[0].url, format!("{base}/ggpht/small.jpg"));
        assert_eq!(thumbs[1].quality, "high");

        // Now served from memory.
        assert!(cache.get("UCabc").is_some());
    }

    #[tokio::test]
    async fn entries_expire_by_ttl() {
        let base = serve(avatar_router()).await;
        let cache = cache_for(Some(base), 0);

        let _ = cache.fetch_and_cache("UCabc").await;
        assert!(cache.get("UCabc").is_none(), "zero TTL entry must read as stale");
        assert_eq!(cache.cleanup_expired(), 1);
    }

    #[tokio::test]
    async fn disabled_backend_schedules_nothing() {
        let cache = cache_for(None, 60);
        cache.schedule_background_fetch("UCabc");
        // No instance configured: fetch path returns None immediately too.
        assert!(cache.fetch_and_cache("UCabc").await.is_none());
        assert!(cache.get("UCabc").is_none());
    }

    #[tokio::test]
    async fn at_capacity_the_oldest_entries_are_evicted() {
        let base = serve(avatar_router()).await;
        let dir = tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")));
        let mut s = settings.get();
        s.invidious_instance = Some(base);
        s.cache_avatar_ttl = 600;
        settings.update(s).unwrap();
        let invidious = Arc::new(InvidiousClient::new(settings.clone()));
        let cache = AvatarCache::with_capacity(settings, invidious, 10);

        let now = Instant::now();
        for i in 0..10u64 {
            cache.seed_entry(&format!("chan{i}"), now - Duration::from_millis(100 - i));
        }

        let _ = cache.fetch_and_cache("UCabc").await.expect("avatars fetched");
        assert_eq!(cache.entry_count(), 10, "cache must not grow past capacity");
        assert!(cache.get("chan0").is_none(), "oldest entry evicted");
        assert!(cache.get("chan9").is_some(), "newer entries kept");
        assert!(cache.get("UCabc").is_some());
    }

    #[tokio::test]
    async fn concurrent_fetches_for_same_channel_dedup() {
        let base = serve(avatar_router()).await;
        let cache = cache_for(Some(base), 60);

        // Mark a fetch as pending; a second caller must bail out.
        cache.pending.lock().insert("UCabc".to_string());
        assert!(cache.fetch_and_cache("UCabc").await.is_none());

        cache.pending.lock().clear();
        assert!(cache.fetch_and_cache("UCabc").await.is_some());
    }
}
