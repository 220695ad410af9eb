#![forbid(unsafe_code)]

//! Feed orchestration: decides which backend serves a channel, normalizes
//! what it returns, and drives the periodic ingestion loop.
//!
//! The primary backend (Invidious) is fast and cheap but only speaks
//! YouTube and fails in more ways; yt-dlp speaks everything and is the
//! fallback. Per-channel failures are recorded in `feed_fetch_status` and
//! never abort a cycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::avatars::AvatarCache;
use crate::invidious::{InvidiousClient, InvidiousVideo, resolve_instance_url};
use crate::security::{SafeResolver, UrlCheck, is_valid_url};
use crate::settings::{Settings, SettingsStore};
use crate::store::{
    CachedVideo, FeedStore, FetchStatusUpdate, Thumbnail, WatchedChannel, quality_for_width,
};
use crate::ytdlp::{YtdlpRunner, YtdlpVideo};

/// Concurrent on-demand single-channel fetches.
const MAX_CONCURRENT_ON_DEMAND: usize = 10;

/// Stored error messages are capped so one giant stack trace cannot bloat
/// the status table.
const ERROR_MESSAGE_LIMIT: usize = 200;

/// Pagination details carried from the primary backend into fetch status.
#[derive(Debug, Clone)]
pub struct PaginationInfo {
    pub total_fetched: usize,
    pub pages_fetched: u32,
    pub pagination_limited: bool,
    pub limit_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelMetadata {
    pub channel_name: Option<String>,
    pub subscriber_count: Option<i64>,
    pub is_verified: Option<bool>,
    pub avatar_url: Option<String>,
}

/// Result of fetching one channel, before persistence. `used_fallback`
/// carries the reason the primary backend was bypassed, when it was.
#[derive(Debug, Default)]
pub struct ChannelFeed {
    pub videos: Vec<CachedVideo>,
    pub pagination: Option<PaginationInfo>,
    pub metadata: Option<ChannelMetadata>,
    pub used_fallback: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pagination_limited: usize,
    pub fell_back: usize,
}

enum PrimaryOutcome {
    /// Backend disabled, nothing attempted.
    Disabled,
    Feed(ChannelFeed),
    /// Primary declined to serve this channel; secondary takes over.
    Fallback(String),
}

/// Fetches and persists per-channel video feeds.
pub struct FeedFetcher {
    settings: Arc<SettingsStore>,
    store: Arc<FeedStore>,
    invidious: Arc<InvidiousClient>,
    ytdlp: YtdlpRunner,
    resolver: SafeResolver,
    avatars: Arc<AvatarCache>,
    fetch_gate: Semaphore,
}

impl FeedFetcher {
    pub fn new(settings: Arc<SettingsStore>, store: Arc<FeedStore>) -> Self {
        let invidious = Arc::new(InvidiousClient::new(settings.clone()));
        let avatars = Arc::new(AvatarCache::new(settings.clone(), invidious.clone()));
        Self {
            ytdlp: YtdlpRunner::new(settings.clone()),
            resolver: SafeResolver::new(settings.clone()),
            fetch_gate: Semaphore::new(MAX_CONCURRENT_ON_DEMAND),
            settings,
            store,
            invidious,
            avatars,
        }
    }

    /// Fetches one channel's feed, choosing the backend. Does not persist.
    pub async fn fetch_channel_feed(&self, channel: &WatchedChannel) -> Result<ChannelFeed> {
        let settings = self.settings.get();
        let mut fallback_reason = None;

        if channel.site == "youtube"
            && settings.invidious_enabled
            && settings.invidious_instance.is_some()
        {
            match self.fetch_from_invidious(&channel.channel_id, &settings).await? {
                PrimaryOutcome::Feed(feed) => return Ok(feed),
                PrimaryOutcome::Fallback(reason) => {
                    info!(
                        channel_id = %channel.channel_id,
                        reason = %reason,
                        "falling back to yt-dlp"
                    );
                    fallback_reason = Some(reason);
                }
                PrimaryOutcome::Disabled => {}
            }
        }

        let (videos, metadata) = self.fetch_from_ytdlp(channel, &settings).await?;
        Ok(ChannelFeed {
            videos,
            pagination: None,
            metadata,
            used_fallback: fallback_reason,
        })
    }

    async fn fetch_from_invidious(
        &self,
        channel_id: &str,
        settings: &Settings,
    ) -> Result<PrimaryOutcome> {
        let paged = match self
            .invidious
            .fetch_channel_videos_paged(channel_id, settings.feed_max_videos)
            .await
        {
            Ok(Some(paged)) => paged,
            Ok(None) => return Ok(PrimaryOutcome::Disabled),
            Err(err) => {
                // 414s surface through the paged result; anything arriving
                // here already exhausted its retries or was never retryable.
                if err.retryable && settings.feed_fallback_ytdlp_on_error {
                    let reason = match err.status {
                        Some(status) => format!("invidious_error_{status}"),
                        None => "invidious_error_connection".to_string(),
                    };
                    return Ok(PrimaryOutcome::Fallback(reason));
                }
                return Err(anyhow::Error::new(err)
                    .context(format!("listing videos for {channel_id}")));
            }
        };

        // An empty listing wins over the 414 signal: a first-page 414 has
        // nothing to serve either way, and the status should say so.
        if paged.videos.is_empty() {
            return Ok(PrimaryOutcome::Fallback("no_videos".to_string()));
        }
        if paged.pagination_limited && settings.feed_fallback_ytdlp_on_414 {
            return Ok(PrimaryOutcome::Fallback("invidious_error_414".to_string()));
        }

        let base = settings.invidious_instance.as_deref().unwrap_or_default();
        let videos: Vec<CachedVideo> = paged
            .videos
            .iter()
            .filter_map(|video| process_invidious_video(video, base))
            .collect();

        // Channel metadata is best effort; its failure never fails the feed.
        let metadata = match self.invidious.get_channel(channel_id).await {
            Ok(Some(channel)) => {
                let avatar_url = channel
                    .author_thumbnails
                    .iter()
                    .filter(|thumb| thumb.url.is_some())
                    .max_by_key(|thumb| thumb.width.unwrap_or(0))
                    .and_then(|thumb| thumb.url.as_deref())
                    .map(|url| resolve_instance_url(base, url));
                Some(ChannelMetadata {
                    channel_name: channel.author,
                    subscriber_count: channel.sub_count,
                    is_verified: channel.author_verified,
                    avatar_url,
                })
            }
            Ok(None) => None,
            Err(err) => {
                warn!(channel_id, %err, "channel metadata fetch failed");
                None
            }
        };

        Ok(PrimaryOutcome::Feed(ChannelFeed {
            videos,
            pagination: Some(PaginationInfo {
                total_fetched: paged.total_fetched,
                pages_fetched: paged.pages_fetched,
                pagination_limited: paged.pagination_limited,
                limit_reason: paged.limit_reason.map(|reason| reason.as_str().to_string()),
            }),
            metadata,
            used_fallback: None,
        }))
    }

    async fn fetch_from_ytdlp(
        &self,
        channel: &WatchedChannel,
        settings: &Settings,
    ) -> Result<(Vec<CachedVideo>, Option<ChannelMetadata>)> {
        let url = self.build_channel_url(channel).await?;
        let records = self
            .ytdlp
            .fetch_channel_videos(&url, settings.feed_max_videos, settings.feed_ytdlp_use_flat_playlist)
            .await
            .with_context(|| format!("listing videos for {}", channel.channel_id))?;

        let videos: Vec<CachedVideo> = records
            .iter()
            .filter_map(|record| process_ytdlp_video(record, channel))
            .collect();

        let mut metadata = records.first().map(|first| ChannelMetadata {
            channel_name: first.channel.clone().or_else(|| first.uploader.clone()),
            subscriber_count: first.channel_follower_count,
            is_verified: first.channel_is_verified,
            avatar_url: None,
        });

        // Flat extraction omits the channel-level fields; one full extraction
        // of the newest video fills them in.
        let needs_info = metadata
            .as_ref()
            .is_some_and(|meta| meta.subscriber_count.is_none() && meta.is_verified.is_none());
        if needs_info && channel.site == "youtube" {
            match self.ytdlp.channel_info(&url).await {
                Ok(Some(info)) => {
                    if let Some(meta) = metadata.as_mut() {
                        meta.subscriber_count = info.channel_follower_count;
                        meta.is_verified = info.channel_is_verified;
                        if meta.channel_name.is_none() {
                            meta.channel_name = info.channel.or(info.uploader);
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(channel_id = %channel.channel_id, %err, "channel info fetch failed");
                }
            }
        }

        Ok((videos, metadata))
    }

    /// Builds the videos-page URL for the secondary backend. YouTube ids use
    /// fixed templates; everything else needs a stored channel URL, which is
    /// untrusted input and goes through the full SSRF check.
    async fn build_channel_url(&self, channel: &WatchedChannel) -> Result<String> {
        if channel.site == "youtube" {
            let id = &channel.channel_id;
            if id.starts_with('@') {
                return Ok(format!("https://www.youtube.com/{id}/videos"));
            }
            if id.starts_with("UC") {
                return Ok(format!("https://www.youtube.com/channel/{id}/videos"));
            }
        }
        let url = channel.channel_url.as_deref().with_context(|| {
            format!("channel {}/{} has no stored URL", channel.site, channel.channel_id)
        })?;
        if !is_valid_url(url) {
            bail!("invalid channel URL: {url}");
        }
        match self.resolver.is_safe_url(url, true).await {
            UrlCheck::Safe => Ok(url.to_string()),
            UrlCheck::Blocked(reason) => bail!("unsafe channel URL {url}: {reason}"),
        }
    }

    /// Persists a fetched feed: replaces the video set, records a success
    /// status with pagination details, applies channel metadata, and for
    /// YouTube channels schedules an avatar refresh.
    ///
    /// An empty fetch records a bare success and leaves the previously
    /// cached videos alone, so one transient empty run cannot destroy a
    /// channel's feed.
    async fn store_feed(&self, channel: &WatchedChannel, feed: &ChannelFeed) -> Result<()> {
        if feed.videos.is_empty() {
            warn!(
                channel_id = %channel.channel_id,
                site = %channel.site,
                "fetch returned no videos, keeping cached feed"
            );
            self.store
                .update_fetch_status(&FetchStatusUpdate {
                    channel_id: channel.channel_id.clone(),
                    site: channel.site.clone(),
                    ..Default::default()
                })
                .await?;
            return Ok(());
        }

        self.store
            .upsert_channel_videos(&channel.channel_id, &channel.site, &feed.videos)
            .await?;

        let (limited, reason) = feed
            .pagination
            .as_ref()
            .map(|p| (p.pagination_limited, p.limit_reason.clone()))
            .unwrap_or((false, None));
        // With pagination the pre-truncation total is the interesting count.
        let fetched = feed
            .pagination
            .as_ref()
            .map(|p| p.total_fetched)
            .unwrap_or(feed.videos.len());
        self.store
            .update_fetch_status(&FetchStatusUpdate {
                channel_id: channel.channel_id.clone(),
                site: channel.site.clone(),
                fetch_error: None,
                max_videos_fetched: Some(fetched as i64),
                pagination_limited: limited,
                pagination_limit_reason: reason,
            })
            .await?;

        if let Some(meta) = &feed.metadata {
            self.store
                .update_channel_metadata(
                    &channel.channel_id,
                    &channel.site,
                    meta.channel_name.as_deref(),
                    meta.subscriber_count,
                    meta.is_verified,
                    meta.avatar_url.as_deref(),
                )
                .await?;
        }

        if channel.site == "youtube" {
            self.avatars.schedule_background_fetch(&channel.channel_id);
        }

        info!(
            channel_id = %channel.channel_id,
            site = %channel.site,
            videos = feed.videos.len(),
            fallback = feed.used_fallback.as_deref().unwrap_or(""),
            "channel feed updated"
        );
        Ok(())
    }

    async fn record_failure(&self, channel_id: &str, site: &str, err: &anyhow::Error) {
        let message = truncate_error(&format!("{err:#}"));
        let update = FetchStatusUpdate {
            channel_id: channel_id.to_string(),
            site: site.to_string(),
            fetch_error: Some(message),
            max_videos_fetched: None,
            pagination_limited: false,
            pagination_limit_reason: None,
        };
        if let Err(status_err) = self.store.update_fetch_status(&update).await {
            warn!(channel_id, site, %status_err, "recording fetch failure failed");
        }
    }

    /// Fetches and persists a single watched channel on demand, bounded by a
    /// semaphore so request bursts cannot stampede the backends.
    pub async fn fetch_single_channel(&self, channel_id: &str, site: &str) -> Result<ChannelFeed> {
        let _permit = self
            .fetch_gate
            .acquire()
            .await
            .context("fetch gate closed")?;

        self.store.touch_channel(channel_id, site).await?;
        let channel = self
            .store
            .get_watched_channel(channel_id, site)
            .await?
            .with_context(|| format!("channel {site}/{channel_id} is not watched"))?;

        match self.fetch_channel_feed(&channel).await {
            Ok(feed) => {
                self.store_feed(&channel, &feed).await?;
                Ok(feed)
            }
            Err(err) => {
                self.record_failure(channel_id, site, &err).await;
                Err(err)
            }
        }
    }

    /// Fetches every watched channel sequentially, with a politeness delay
    /// between channels. A failing channel is recorded and skipped.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let channels = self.store.list_watched_channels().await?;
        let delay = Duration::from_secs(self.settings.get().feed_channel_delay);
        let mut stats = CycleStats {
            total: channels.len(),
            ..Default::default()
        };

        for (index, channel) in channels.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                sleep(delay).await;
            }
            match self.fetch_channel_feed(channel).await {
                Ok(feed) => {
                    if let Err(err) = self.store_feed(channel, &feed).await {
                        warn!(channel_id = %channel.channel_id, err = %format!("{err:#}"), "persisting feed failed");
                        self.record_failure(&channel.channel_id, &channel.site, &err).await;
                        stats.failed += 1;
                        continue;
                    }
                    stats.succeeded += 1;
                    if feed.pagination.as_ref().is_some_and(|p| p.pagination_limited) {
                        stats.pagination_limited += 1;
                    }
                    if feed.used_fallback.is_some() {
                        stats.fell_back += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        channel_id = %channel.channel_id,
                        site = %channel.site,
                        err = %format!("{err:#}"),
                        "channel fetch failed"
                    );
                    self.record_failure(&channel.channel_id, &channel.site, &err).await;
                    stats.failed += 1;
                }
            }
        }

        info!(
            total = stats.total,
            succeeded = stats.succeeded,
            failed = stats.failed,
            pagination_limited = stats.pagination_limited,
            fell_back = stats.fell_back,
            "feed cycle finished"
        );
        Ok(stats)
    }

    /// Drives cycles forever: fetch everything, sweep expired data, sleep.
    pub async fn run_loop(&self) {
        loop {
            if let Err(err) = self.run_cycle().await {
                error!(err = %format!("{err:#}"), "feed cycle failed");
            }
            self.run_cleanups().await;
            let interval = self.settings.get().feed_fetch_interval;
            sleep(Duration::from_secs(interval)).await;
        }
    }

    /// Sweeps aged-out videos, stale channels, orphaned videos, and expired
    /// avatars. Failures are logged, never fatal.
    pub async fn run_cleanups(&self) {
        let settings = self.settings.get();
        match self.store.cleanup_videos_older_than(settings.feed_video_max_age).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "purged aged-out videos"),
            Err(err) => warn!(%err, "video cleanup failed"),
        }
        match self.store.cleanup_stale_channels(settings.feed_channel_retention).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "purged stale channels"),
            Err(err) => warn!(%err, "channel cleanup failed"),
        }
        match self.store.cleanup_orphaned_videos().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "purged orphaned videos"),
            Err(err) => warn!(%err, "orphan cleanup failed"),
        }
        self.avatars.cleanup_expired();
    }
}

fn invidious_quality_score(quality: &str) -> u8 {
    match quality {
        "maxres" | "maxresdefault" => 5,
        "sddefault" => 4,
        "high" => 3,
        "medium" => 2,
        "default" => 1,
        _ => 0,
    }
}

fn process_invidious_video(video: &InvidiousVideo, base: &str) -> Option<CachedVideo> {
    let video_id = video.video_id.clone()?;

    let thumbnails: Vec<Thumbnail> = video
        .video_thumbnails
        .iter()
        .filter_map(|thumb| {
            let url = thumb.url.as_deref()?;
            Some(Thumbnail {
                quality: thumb
                    .quality
                    .clone()
                    .unwrap_or_else(|| quality_for_width(thumb.width).to_string()),
                url: resolve_instance_url(base, url),
                width: thumb.width,
                height: thumb.height,
            })
        })
        .collect();
    let thumbnail_url = thumbnails
        .iter()
        .max_by_key(|t| (invidious_quality_score(&t.quality), t.width.unwrap_or(0)))
        .map(|t| t.url.clone());

    Some(CachedVideo {
        video_url: Some(format!("https://www.youtube.com/watch?v={video_id}")),
        video_id,
        title: video.title.clone().unwrap_or_default(),
        author: video.author.clone(),
        author_id: video.author_id.clone(),
        length_seconds: video.length_seconds,
        view_count: video.view_count,
        published: video.published,
        published_text: video.published_text.clone(),
        thumbnail_url,
        thumbnails,
    })
}

fn process_ytdlp_video(record: &YtdlpVideo, channel: &WatchedChannel) -> Option<CachedVideo> {
    let video_id = record.id.clone()?;

    let thumbnails: Vec<Thumbnail> = record
        .thumbnails
        .iter()
        .filter_map(|thumb| {
            let url = thumb.url.clone()?;
            Some(Thumbnail {
                quality: quality_for_width(thumb.width).to_string(),
                url,
                width: thumb.width,
                height: thumb.height,
            })
        })
        .collect();
    let thumbnail_url = record.thumbnail.clone().or_else(|| {
        thumbnails
            .iter()
            .max_by_key(|t| t.width.unwrap_or(0))
            .map(|t| t.url.clone())
    });

    let published = record
        .timestamp
        .or_else(|| record.upload_date.as_deref().and_then(parse_date_string));

    let video_url = record
        .webpage_url
        .clone()
        .or_else(|| record.url.clone())
        .or_else(|| {
            (channel.site == "youtube")
                .then(|| format!("https://www.youtube.com/watch?v={video_id}"))
        });

    Some(CachedVideo {
        title: record.title.clone().unwrap_or_default(),
        author: record
            .channel
            .clone()
            .or_else(|| record.uploader.clone())
            .or_else(|| channel.channel_name.clone()),
        author_id: record
            .channel_id
            .clone()
            .or_else(|| record.uploader_id.clone())
            .or_else(|| Some(channel.channel_id.clone())),
        length_seconds: record.duration.map(|d| d as i64),
        view_count: record.view_count,
        published,
        published_text: None,
        thumbnail_url,
        thumbnails,
        video_url,
        video_id,
    })
}

/// Parses the date formats the backends emit: bare `YYYYMMDD` (yt-dlp's
/// `upload_date`) or RFC 3339.
fn parse_date_string(text: &str) -> Option<i64> {
    if text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit()) {
        let date = NaiveDate::parse_from_str(text, "%Y%m%d").ok()?;
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
    }
    DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.timestamp())
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_LIMIT {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_LIMIT).collect()
    }
}
