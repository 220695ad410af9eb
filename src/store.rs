#![forbid(unsafe_code)]

//! Feed persistence layer: watched channels, their cached videos, and
//! per-channel fetch status.
//!
//! All timestamps are stored as UTC `YYYY-MM-DD HH:MM:SS` strings so they
//! compare correctly against sqlite's `datetime('now', ...)` in the cleanup
//! queries.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A channel the feed keeps fresh. `last_requested` drives retention:
/// channels nobody asks about eventually stop being fetched and get purged.
#[derive(Debug, Clone)]
pub struct WatchedChannel {
    pub channel_id: String,
    pub site: String,
    pub channel_name: Option<String>,
    pub channel_url: Option<String>,
    pub avatar_url: Option<String>,
    pub last_requested: Option<String>,
    pub subscriber_count: Option<i64>,
    pub is_verified: Option<bool>,
    pub metadata_updated_at: Option<String>,
}

impl WatchedChannel {
    pub fn new(channel_id: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            site: site.into(),
            channel_name: None,
            channel_url: None,
            avatar_url: None,
            last_requested: None,
            subscriber_count: None,
            is_verified: None,
            metadata_updated_at: None,
        }
    }
}

/// Normalized thumbnail variant, serialized as JSON alongside each video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thumbnail {
    pub quality: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Quality bucket for a thumbnail of the given width.
pub fn quality_for_width(width: Option<u32>) -> &'static str {
    match width.unwrap_or(0) {
        w if w >= 1280 => "maxres",
        w if w >= 640 => "sddefault",
        w if w >= 480 => "high",
        w if w >= 320 => "medium",
        _ => "default",
    }
}

/// One normalized video row, backend-agnostic.
#[derive(Debug, Clone, Default)]
pub struct CachedVideo {
    pub video_id: String,
    pub title: String,
    pub author: Option<String>,
    pub author_id: Option<String>,
    pub length_seconds: Option<i64>,
    pub view_count: Option<i64>,
    pub published: Option<i64>,
    pub published_text: Option<String>,
    pub thumbnail_url: Option<String>,
    pub thumbnails: Vec<Thumbnail>,
    pub video_url: Option<String>,
}

/// Outcome of a replace-all write for one channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertStats {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Fields recorded after every fetch attempt, success or failure.
#[derive(Debug, Clone, Default)]
pub struct FetchStatusUpdate {
    pub channel_id: String,
    pub site: String,
    pub fetch_error: Option<String>,
    pub max_videos_fetched: Option<i64>,
    pub pagination_limited: bool,
    pub pagination_limit_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchStatus {
    pub channel_id: String,
    pub site: String,
    pub last_fetch: Option<String>,
    pub fetch_error: Option<String>,
    pub max_videos_fetched: Option<i64>,
    pub pagination_limited: bool,
    pub pagination_limit_reason: Option<String>,
}

/// Current UTC time in the store's canonical format.
pub fn now_utc() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // `PRAGMA journal_mode` returns a row, which execute_batch rejects.
    conn.query("PRAGMA journal_mode=WAL;", params![]).await?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS watched_channels (
            channel_id TEXT NOT NULL,
            site TEXT NOT NULL,
            channel_name TEXT,
            channel_url TEXT,
            avatar_url TEXT,
            last_requested TEXT,
            subscriber_count INTEGER,
            is_verified INTEGER,
            metadata_updated_at TEXT,
            PRIMARY KEY (channel_id, site)
        );

        CREATE TABLE IF NOT EXISTS cached_videos (
            channel_id TEXT NOT NULL,
            site TEXT NOT NULL,
            video_id TEXT NOT NULL,
            title TEXT NOT NULL,
            author TEXT,
            author_id TEXT,
            length_seconds INTEGER,
            view_count INTEGER,
            published INTEGER,
            published_text TEXT,
            thumbnail_url TEXT,
            thumbnails_json TEXT DEFAULT '[]',
            video_url TEXT,
            fetched_at TEXT NOT NULL,
            PRIMARY KEY (channel_id, site, video_id)
        );

        CREATE TABLE IF NOT EXISTS feed_fetch_status (
            channel_id TEXT NOT NULL,
            site TEXT NOT NULL,
            last_fetch TEXT,
            fetch_error TEXT,
            max_videos_fetched INTEGER,
            pagination_limited INTEGER NOT NULL DEFAULT 0,
            pagination_limit_reason TEXT,
            PRIMARY KEY (channel_id, site)
        );

        CREATE INDEX IF NOT EXISTS idx_cached_videos_channel
            ON cached_videos(channel_id, site);
        CREATE INDEX IF NOT EXISTS idx_cached_videos_fetched_at
            ON cached_videos(fetched_at);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite-compatible connection that performs all feed
/// reads and writes.
pub struct FeedStore {
    conn: Connection,
}

impl FeedStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the
    /// expected schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating feed directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening feed DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts or refreshes a watched channel, stamping `last_requested`.
    pub async fn upsert_watched_channel(&self, channel: &WatchedChannel) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO watched_channels (
                    channel_id, site, channel_name, channel_url, avatar_url,
                    last_requested, subscriber_count, is_verified, metadata_updated_at
                ) VALUES (
                    :channel_id, :site, :channel_name, :channel_url, :avatar_url,
                    :last_requested, :subscriber_count, :is_verified, :metadata_updated_at
                )
                ON CONFLICT(channel_id, site) DO UPDATE SET
                    channel_name = COALESCE(excluded.channel_name, channel_name),
                    channel_url = COALESCE(excluded.channel_url, channel_url),
                    avatar_url = COALESCE(excluded.avatar_url, avatar_url),
                    last_requested = excluded.last_requested
                "#,
                params![
                    channel.channel_id.as_str(),
                    channel.site.as_str(),
                    channel.channel_name.as_deref(),
                    channel.channel_url.as_deref(),
                    channel.avatar_url.as_deref(),
                    now_utc(),
                    channel.subscriber_count,
                    channel.is_verified.map(|flag| flag as i64),
                    channel.metadata_updated_at.as_deref(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Stamps `last_requested` for an already watched channel.
    pub async fn touch_channel(&self, channel_id: &str, site: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE watched_channels SET last_requested = ?1 \
                 WHERE channel_id = ?2 AND site = ?3",
                params![now_utc(), channel_id, site],
            )
            .await?;
        Ok(())
    }

    pub async fn list_watched_channels(&self) -> Result<Vec<WatchedChannel>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT channel_id, site, channel_name, channel_url, avatar_url,
                       last_requested, subscriber_count, is_verified, metadata_updated_at
                FROM watched_channels
                ORDER BY site ASC, channel_id ASC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    pub async fn get_watched_channel(
        &self,
        channel_id: &str,
        site: &str,
    ) -> Result<Option<WatchedChannel>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT channel_id, site, channel_name, channel_url, avatar_url,
                       last_requested, subscriber_count, is_verified, metadata_updated_at
                FROM watched_channels
                WHERE channel_id = ?1 AND site = ?2
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![channel_id, site]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    /// Replaces a channel's cached video set in one transaction so readers
    /// never see a mix of old and new listings. Duplicate video ids keep
    /// their first occurrence; the rest are counted and skipped.
    pub async fn upsert_channel_videos(
        &self,
        channel_id: &str,
        site: &str,
        videos: &[CachedVideo],
    ) -> Result<UpsertStats> {
        let fetched_at = now_utc();
        let mut stats = UpsertStats::default();
        let mut seen: HashSet<&str> = HashSet::new();

        let tx = self.conn.transaction().await?;
        tx.execute(
            "DELETE FROM cached_videos WHERE channel_id = ?1 AND site = ?2",
            params![channel_id, site],
        )
        .await?;

        for video in videos {
            if !seen.insert(video.video_id.as_str()) {
                stats.duplicates += 1;
                continue;
            }
            let thumbnails_json =
                serde_json::to_string(&video.thumbnails).context("serializing thumbnails")?;
            tx.execute(
                r#"
                INSERT INTO cached_videos (
                    channel_id, site, video_id, title, author, author_id,
                    length_seconds, view_count, published, published_text,
                    thumbnail_url, thumbnails_json, video_url, fetched_at
                ) VALUES (
                    :channel_id, :site, :video_id, :title, :author, :author_id,
                    :length_seconds, :view_count, :published, :published_text,
                    :thumbnail_url, :thumbnails_json, :video_url, :fetched_at
                )
                "#,
                params![
                    channel_id,
                    site,
                    video.video_id.as_str(),
                    video.title.as_str(),
                    video.author.as_deref(),
                    video.author_id.as_deref(),
                    video.length_seconds,
                    video.view_count,
                    video.published,
                    video.published_text.as_deref(),
                    video.thumbnail_url.as_deref(),
                    thumbnails_json,
                    video.video_url.as_deref(),
                    fetched_at.as_str(),
                ],
            )
            .await?;
            stats.inserted += 1;
        }

        tx.commit().await?;
        if stats.duplicates > 0 {
            debug!(channel_id, site, duplicates = stats.duplicates, "skipped duplicate videos");
        }
        Ok(stats)
    }

    /// Returns a channel's cached videos, newest first.
    pub async fn list_channel_videos(
        &self,
        channel_id: &str,
        site: &str,
    ) -> Result<Vec<CachedVideo>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT video_id, title, author, author_id, length_seconds,
                       view_count, published, published_text, thumbnail_url,
                       thumbnails_json, video_url
                FROM cached_videos
                WHERE channel_id = ?1 AND site = ?2
                ORDER BY published DESC, rowid ASC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![channel_id, site]).await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }

    /// Records the outcome of a fetch attempt, stamping `last_fetch`.
    pub async fn update_fetch_status(&self, update: &FetchStatusUpdate) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO feed_fetch_status (
                    channel_id, site, last_fetch, fetch_error,
                    max_videos_fetched, pagination_limited, pagination_limit_reason
                ) VALUES (
                    :channel_id, :site, :last_fetch, :fetch_error,
                    :max_videos_fetched, :pagination_limited, :pagination_limit_reason
                )
                ON CONFLICT(channel_id, site) DO UPDATE SET
                    last_fetch = excluded.last_fetch,
                    fetch_error = excluded.fetch_error,
                    max_videos_fetched = excluded.max_videos_fetched,
                    pagination_limited = excluded.pagination_limited,
                    pagination_limit_reason = excluded.pagination_limit_reason
                "#,
                params![
                    update.channel_id.as_str(),
                    update.site.as_str(),
                    now_utc(),
                    update.fetch_error.as_deref(),
                    update.max_videos_fetched,
                    update.pagination_limited as i64,
                    update.pagination_limit_reason.as_deref(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_fetch_status(
        &self,
        channel_id: &str,
        site: &str,
    ) -> Result<Option<FetchStatus>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT channel_id, site, last_fetch, fetch_error,
                       max_videos_fetched, pagination_limited, pagination_limit_reason
                FROM feed_fetch_status
                WHERE channel_id = ?1 AND site = ?2
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![channel_id, site]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(FetchStatus {
                channel_id: row.get(0)?,
                site: row.get(1)?,
                last_fetch: row.get(2)?,
                fetch_error: row.get(3)?,
                max_videos_fetched: row.get(4)?,
                pagination_limited: row.get::<i64>(5)? != 0,
                pagination_limit_reason: row.get(6)?,
            })),
            None => Ok(None),
        }
    }

    /// Updates channel-level metadata, keeping existing values where the new
    /// fetch produced none, and stamps `metadata_updated_at`.
    pub async fn update_channel_metadata(
        &self,
        channel_id: &str,
        site: &str,
        channel_name: Option<&str>,
        subscriber_count: Option<i64>,
        is_verified: Option<bool>,
        avatar_url: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                r#"
                UPDATE watched_channels SET
                    channel_name = COALESCE(?3, channel_name),
                    subscriber_count = COALESCE(?4, subscriber_count),
                    is_verified = COALESCE(?5, is_verified),
                    avatar_url = COALESCE(?6, avatar_url),
                    metadata_updated_at = ?7
                WHERE channel_id = ?1 AND site = ?2
                "#,
                params![
                    channel_id,
                    site,
                    channel_name,
                    subscriber_count,
                    is_verified.map(|flag| flag as i64),
                    avatar_url,
                    now_utc(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Deletes cached videos fetched more than `days` days ago.
    pub async fn cleanup_videos_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = format!("-{days} days");
        let removed = self
            .conn
            .execute(
                "DELETE FROM cached_videos WHERE fetched_at < datetime('now', ?1)",
                params![cutoff],
            )
            .await?;
        Ok(removed)
    }

    /// Deletes watched channels nobody requested within the retention window,
    /// along with their fetch status rows.
    pub async fn cleanup_stale_channels(&self, days: i64) -> Result<u64> {
        let cutoff = format!("-{days} days");
        let tx = self.conn.transaction().await?;
        let removed = tx
            .execute(
                "DELETE FROM watched_channels \
                 WHERE last_requested IS NULL OR last_requested < datetime('now', ?1)",
                params![cutoff.as_str()],
            )
            .await?;
        tx.execute(
            "DELETE FROM feed_fetch_status WHERE NOT EXISTS (\
                 SELECT 1 FROM watched_channels w \
                 WHERE w.channel_id = feed_fetch_status.channel_id \
                   AND w.site = feed_fetch_status.site)",
            params![],
        )
        .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Deletes cached videos whose channel is no longer watched.
    pub async fn cleanup_orphaned_videos(&self) -> Result<u64> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM cached_videos WHERE NOT EXISTS (\
                     SELECT 1 FROM watched_channels w \
                     WHERE w.channel_id = cached_videos.channel_id \
                       AND w.site = cached_videos.site)",
                params![],
            )
            .await?;
        Ok(removed)
    }
}

fn row_to_channel(row: &Row) -> Result<WatchedChannel> {
    Ok(WatchedChannel {
        channel_id: row.get(0)?,
        site: row.get(1)?,
        channel_name: row.get(2)?,
        channel_url: row.get(3)?,
        avatar_url: row.get(4)?,
        last_requested: row.get(5)?,
        subscriber_count: row.get(6)?,
        is_verified: row.get::<Option<i64>>(7)?.map(|value| value != 0),
        metadata_updated_at: row.get(8)?,
    })
}

fn row_to_video(row: &Row) -> Result<CachedVideo> {
    let thumbnails_json: String = row.get(9)?;
    let thumbnails: Vec<Thumbnail> =
        serde_json::from_str(&thumbnails_json).context("parsing stored thumbnails JSON")?;
    Ok(CachedVideo {
        video_id: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        author_id: row.get(3)?,
        length_seconds: row.get(4)?,
        view_count: row.get(5)?,
        published: row.get(6)?,
        published_text: row.get(7)?,
        thumbnail_url: row.get(8)?,
        thumbnails,
        video_url: row.get(10)?,
    })
}
