#![forbid(unsafe_code)]

//! Runtime settings with JSON-file persistence and hot reload.
//!
//! The daemon reads settings at every decision point instead of caching them
//! in each component, so an admin edit followed by a reload takes effect on
//! the next fetch without a restart.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Recognized runtime options. Unknown keys in the settings file are ignored
/// so older files keep loading after upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path to the yt-dlp executable.
    pub ytdlp_path: String,
    /// Hard timeout for a single yt-dlp invocation, in seconds.
    pub ytdlp_timeout: u64,

    pub invidious_enabled: bool,
    /// Admin-configured Invidious-compatible instance base URL.
    pub invidious_instance: Option<String>,
    /// Per-request timeout for the Invidious client, in seconds.
    pub invidious_timeout: u64,
    /// Additional attempts after the initial request.
    pub invidious_max_retries: u32,
    /// Base delay for exponential backoff, in seconds.
    pub invidious_retry_delay: f64,

    /// Seconds between full feed fetch cycles.
    pub feed_fetch_interval: u64,
    /// Seconds to wait between channels within a cycle (rate-limit politeness).
    pub feed_channel_delay: u64,
    /// Per-channel cap on cached videos.
    pub feed_max_videos: usize,
    /// Cached videos older than this many days are purged.
    pub feed_video_max_age: i64,
    /// Watched channels not requested within this many days are purged.
    pub feed_channel_retention: i64,
    pub feed_ytdlp_use_flat_playlist: bool,
    /// Fall back to yt-dlp when Invidious pagination hits a 414.
    pub feed_fallback_ytdlp_on_414: bool,
    /// Fall back to yt-dlp when Invidious fails after all retries.
    pub feed_fallback_ytdlp_on_error: bool,

    /// TTL for cached DNS resolutions, in seconds.
    pub dns_cache_ttl: u64,
    /// TTL for cached channel avatars, in seconds.
    pub cache_avatar_ttl: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            ytdlp_timeout: 120,
            invidious_enabled: true,
            invidious_instance: None,
            invidious_timeout: 10,
            invidious_max_retries: 3,
            invidious_retry_delay: 1.0,
            feed_fetch_interval: 1800,
            feed_channel_delay: 2,
            feed_max_videos: 30,
            feed_video_max_age: 30,
            feed_channel_retention: 14,
            feed_ytdlp_use_flat_playlist: true,
            feed_fallback_ytdlp_on_414: false,
            feed_fallback_ytdlp_on_error: true,
            dns_cache_ttl: 30,
            cache_avatar_ttl: 86_400,
        }
    }
}

/// File-backed settings holder shared across every component.
///
/// Reads go through a `RwLock` snapshot so the hot path never touches disk;
/// `reload` re-reads the file for out-of-band edits.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or unreadable as JSON.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Settings::default(),
        };
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    /// Returns a snapshot of the current settings.
    pub fn get(&self) -> Settings {
        self.current.read().clone()
    }

    /// Replaces the current settings and persists them atomically
    /// (write-then-rename, same as the env file handling in the installer).
    pub fn update(&self, settings: Settings) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(&settings).context("serializing settings")?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, raw)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        *self.current.write() = settings;
        Ok(())
    }

    /// Re-reads the settings file, picking up external edits.
    pub fn reload(&self) -> Result<()> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let settings: Settings = serde_json::from_str(&raw).context("parsing settings file")?;
        *self.current.write() = settings;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
