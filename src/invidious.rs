#![forbid(unsafe_code)]

//! Client for Invidious-compatible APIs: the primary metadata backend.
//!
//! Requests carry a classified error type so the orchestrator can tell a
//! transient upstream failure (retried here with exponential backoff) from a
//! permanent one (surfaced immediately). Channel video listings follow
//! continuation tokens across pages until the per-channel cap is met.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::settings::SettingsStore;

/// HTTP statuses worth retrying: server-side failures and throttling.
const RETRYABLE_STATUSES: &[u16] = &[500, 502, 503, 504, 408, 429];

/// Classified backend failure. `retryable` drives both the client's own
/// retry loop and the orchestrator's fallback decision.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct InvidiousError {
    pub status: Option<u16>,
    pub retryable: bool,
    pub message: String,
}

impl InvidiousError {
    fn from_status(status: u16, endpoint: &str) -> Self {
        Self {
            status: Some(status),
            retryable: RETRYABLE_STATUSES.contains(&status),
            message: format!("HTTP {status} from {endpoint}"),
        }
    }

    fn connection(message: String) -> Self {
        Self {
            status: None,
            retryable: true,
            message,
        }
    }

    fn fatal(message: String) -> Self {
        Self {
            status: None,
            retryable: false,
            message,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct InvidiousThumbnail {
    pub quality: Option<String>,
    pub url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct InvidiousVideo {
    pub video_id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub author_id: Option<String>,
    pub length_seconds: Option<i64>,
    pub view_count: Option<i64>,
    pub published: Option<i64>,
    pub published_text: Option<String>,
    pub video_thumbnails: Vec<InvidiousThumbnail>,
}

/// One page of a channel's video listing. `videos: None` means the response
/// lacked the field entirely, which is distinct from an empty page.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VideosPage {
    pub videos: Option<Vec<InvidiousVideo>>,
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct InvidiousChannel {
    pub author: Option<String>,
    pub sub_count: Option<i64>,
    pub author_verified: Option<bool>,
    pub author_thumbnails: Vec<InvidiousThumbnail>,
}

/// Why pagination stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    /// Continuation token grew past what the instance accepts (HTTP 414).
    UriTooLong,
    /// Response carried no `videos` field.
    NoData,
    /// Response carried an empty page.
    NoVideos,
    /// No continuation token on the last page.
    NoContinuation,
    /// The per-channel cap was reached.
    MaxReached,
}

impl LimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitReason::UriTooLong => "414_error",
            LimitReason::NoData => "no_data",
            LimitReason::NoVideos => "no_videos",
            LimitReason::NoContinuation => "no_continuation",
            LimitReason::MaxReached => "max_reached",
        }
    }
}

/// Result of a multi-page listing. `pagination_limited` is set only for the
/// 414 case; every other stop is a normal end of pagination.
#[derive(Debug)]
pub struct PagedVideos {
    pub videos: Vec<InvidiousVideo>,
    pub total_fetched: usize,
    pub pages_fetched: u32,
    pub pagination_limited: bool,
    pub limit_reason: Option<LimitReason>,
}

struct ClientSlot {
    client: reqwest::Client,
    timeout_secs: u64,
}

/// Thin client over one shared connection pool. The pool is rebuilt only
/// when the configured timeout changes, so hot-reloaded settings take effect
/// without churning connections on every request.
pub struct InvidiousClient {
    settings: Arc<SettingsStore>,
    slot: Mutex<Option<ClientSlot>>,
}

impl InvidiousClient {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            slot: Mutex::new(None),
        }
    }

    fn http_client(&self, timeout_secs: u64) -> Result<reqwest::Client, InvidiousError> {
        let mut slot = self.slot.lock();
        if let Some(current) = slot.as_ref()
            && current.timeout_secs == timeout_secs
        {
            return Ok(current.client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| InvidiousError::fatal(format!("building HTTP client: {err}")))?;
        *slot = Some(ClientSlot {
            client: client.clone(),
            timeout_secs,
        });
        Ok(client)
    }

    /// Fetches `/api/v1/{endpoint}` as JSON with classified retries.
    ///
    /// Returns `Ok(None)` without touching the network when the backend is
    /// disabled or no instance is configured. Retryable failures are retried
    /// up to `invidious_max_retries` extra attempts with exponential backoff
    /// (`invidious_retry_delay * 2^(n-1)` before retry n, no jitter); the
    /// rest, including bodies that fail to parse, error out immediately.
    pub async fn fetch_json(&self, endpoint: &str) -> Result<Option<Value>, InvidiousError> {
        let settings = self.settings.get();
        if !settings.invidious_enabled {
            return Ok(None);
        }
        let Some(instance) = settings.invidious_instance.as_deref() else {
            return Ok(None);
        };
        let base = instance.trim_end_matches('/');
        let url = format!("{base}/api/v1/{endpoint}");
        let client = self.http_client(settings.invidious_timeout)?;

        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let delay =
                    settings.invidious_retry_delay * 2f64.powi(attempt as i32 - 1);
                debug!(endpoint, attempt, delay, "retrying request");
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }

            let err = match client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        return match response.json::<Value>().await {
                            Ok(value) => Ok(Some(value)),
                            Err(err) => Err(InvidiousError::fatal(format!(
                                "invalid JSON from {endpoint}: {err}"
                            ))),
                        };
                    }
                    InvidiousError::from_status(status, endpoint)
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    InvidiousError::connection(format!("request to {endpoint} failed: {err}"))
                }
                Err(err) => {
                    return Err(InvidiousError::fatal(format!(
                        "request to {endpoint} failed: {err}"
                    )));
                }
            };

            if !err.retryable || attempt >= settings.invidious_max_retries {
                return Err(err);
            }
            warn!(endpoint, attempt, %err, "retryable backend failure");
            attempt += 1;
        }
    }

    /// Fetches channel metadata (subscriber count, verified badge, avatars).
    pub async fn get_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<InvidiousChannel>, InvidiousError> {
        let Some(value) = self.fetch_json(&format!("channels/{channel_id}")).await? else {
            return Ok(None);
        };
        let channel = serde_json::from_value(value)
            .map_err(|err| InvidiousError::fatal(format!("invalid channel payload: {err}")))?;
        Ok(Some(channel))
    }

    /// Fetches one page of a channel's videos, optionally continuing from a
    /// previous page's token.
    pub async fn get_channel_videos(
        &self,
        channel_id: &str,
        continuation: Option<&str>,
    ) -> Result<Option<VideosPage>, InvidiousError> {
        let endpoint = match continuation {
            Some(token) => {
                let encoded: String =
                    url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
                format!("channels/{channel_id}/videos?continuation={encoded}")
            }
            None => format!("channels/{channel_id}/videos"),
        };
        let Some(value) = self.fetch_json(&endpoint).await? else {
            return Ok(None);
        };
        let page = serde_json::from_value(value)
            .map_err(|err| InvidiousError::fatal(format!("invalid videos payload: {err}")))?;
        Ok(Some(page))
    }

    /// Follows continuation tokens until `max_videos` are collected or
    /// pagination ends, recording why it stopped.
    ///
    /// A 414 means the accumulated continuation token no longer fits in a
    /// URI; the videos gathered so far are kept and the result is flagged
    /// `pagination_limited`. Any other error aborts the whole listing.
    pub async fn fetch_channel_videos_paged(
        &self,
        channel_id: &str,
        max_videos: usize,
    ) -> Result<Option<PagedVideos>, InvidiousError> {
        let mut videos: Vec<InvidiousVideo> = Vec::new();
        let mut continuation: Option<String> = None;
        let mut pages_fetched: u32 = 0;
        let mut pagination_limited = false;
        let mut limit_reason: Option<LimitReason> = None;

        loop {
            let page = match self
                .get_channel_videos(channel_id, continuation.as_deref())
                .await
            {
                Ok(Some(page)) => page,
                Ok(None) => return Ok(None),
                Err(err) if err.status == Some(414) => {
                    warn!(channel_id, pages_fetched, "continuation token overflowed the URI");
                    pagination_limited = true;
                    limit_reason = Some(LimitReason::UriTooLong);
                    break;
                }
                Err(err) => return Err(err),
            };
            pages_fetched += 1;

            let Some(page_videos) = page.videos else {
                limit_reason = Some(LimitReason::NoData);
                break;
            };
            if page_videos.is_empty() {
                limit_reason = Some(LimitReason::NoVideos);
                break;
            }
            videos.extend(page_videos);

            if videos.len() >= max_videos {
                limit_reason = Some(LimitReason::MaxReached);
                break;
            }
            match page.continuation {
                Some(token) if !token.is_empty() => continuation = Some(token),
                _ => {
                    limit_reason = Some(LimitReason::NoContinuation);
                    break;
                }
            }
        }

        // Reaching the cap wins over whatever the page stopped on.
        if videos.len() >= max_videos {
            limit_reason = Some(LimitReason::MaxReached);
        }
        let total_fetched = videos.len();
        videos.truncate(max_videos);

        Ok(Some(PagedVideos {
            videos,
            total_fetched,
            pages_fetched,
            pagination_limited,
            limit_reason,
        }))
    }
}

/// Resolves a possibly relative URL (as Invidious returns for proxied
/// thumbnails) against the instance base.
pub fn resolve_instance_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    match Url::parse(base).and_then(|base| base.join(url)) {
        Ok(joined) => joined.to_string(),
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::Query;
    use axum::http::StatusCode;
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

    fn client_for(instance: Option<String>) -> InvidiousClient {
        let dir = tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")));
        let mut s = settings.get();
        s.invidious_instance = instance;
        s.invidious_retry_delay = 0.001;
        settings.update(s).unwrap();
        InvidiousClient::new(settings)
    }

    fn video(id: &str) -> Value {
        json!({
            "videoId": id,
            "title": format!("video {id}"),
            "author": "Channel",
            "authorId": "UCabc",
            "lengthSeconds": 60,
            "viewCount": 100,
            "published": 1_700_000_000,
            "publishedText": "1 day ago",
            "videoThumbnails": [
                {"quality": "maxres", "url": "/vi/x/maxres.jpg", "width": 1280, "height": 720}
            ]
        })
    }

    fn videos(ids: std::ops::Range<u32>, continuation: Option<&str>) -> Value {
        let mut page = json!({
            "videos": ids.map(|i| video(&format!("v{i}"))).collect::<Vec<_>>(),
        });
        if let Some(token) = continuation {
            page["continuation"] = json!(token);
        }
        page
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let router = Router::new().route(
            "/api/v1/channels/UCabc/videos",
            get(move || {
                let seen = seen.clone();
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})))
                    } else {
                        (StatusCode::OK, Json(videos(0..3, None)))
                    }
                }
            }),
        );
        let base = serve(router).await;

        let client = client_for(Some(base));
        let page = client.get_channel_videos("UCabc", None).await.unwrap().unwrap();
        assert_eq!(page.videos.unwrap().len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_on_first_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let router = Router::new().route(
            "/api/v1/channels/UCgone/videos",
            get(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::NOT_FOUND, Json(json!({"error": "unknown channel"}))) }
            }),
        );
        let base = serve(router).await;

        let client = client_for(Some(base));
        let err = client.get_channel_videos("UCgone", None).await.unwrap_err();
        assert_eq!(err.status, Some(404));
        assert!(!err.retryable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_errors_exhaust_and_surface() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let router = Router::new().route(
            "/api/v1/channels/UCdown/videos",
            get(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::SERVICE_UNAVAILABLE, Json(json!({}))) }
            }),
        );
        let base = serve(router).await;

        let client = client_for(Some(base));
        let err = client.get_channel_videos("UCdown", None).await.unwrap_err();
        assert_eq!(err.status, Some(503));
        assert!(err.retryable);
        // Initial attempt plus invidious_max_retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn disabled_backend_skips_network() {
        let client = client_for(None);
        assert!(client.fetch_json("channels/UCabc").await.unwrap().is_none());

        let client = client_for(Some("http://127.0.0.1:1".into()));
        let mut s = client.settings.get();
        s.invidious_enabled = false;
        client.settings.update(s).unwrap();
        assert!(client.fetch_json("channels/UCabc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pagination_follows_continuations_up_to_the_cap() {
        let router = Router::new().route(
            "/api/v1/channels/UCabc/videos",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                match params.get("continuation").map(String::as_str) {
                    None => Json(videos(0..20, Some("tok-1"))),
                    Some("tok-1") => Json(videos(20..40, None)),
                    Some(other) => panic!("unexpected continuation {other}"),
                }
            }),
        );
        let base = serve(router).await;

        let client = client_for(Some(base));
        let paged = client
            .fetch_channel_videos_paged("UCabc", 30)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paged.videos.len(), 30);
        assert_eq!(paged.total_fetched, 40);
        assert_eq!(paged.pages_fetched, 2);
        assert!(!paged.pagination_limited);
        assert_eq!(paged.limit_reason, Some(LimitReason::MaxReached));
    }

    #[tokio::test]
    async fn pagination_stops_without_continuation() {
        let router = Router::new().route(
            "/api/v1/channels/UCsmall/videos",
            get(|| async { Json(videos(0..5, None)) }),
        );
        let base = serve(router).await;

        let client = client_for(Some(base));
        let paged = client
            .fetch_channel_videos_paged("UCsmall", 30)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paged.videos.len(), 5);
        assert!(!paged.pagination_limited);
        assert_eq!(paged.limit_reason, Some(LimitReason::NoContinuation));
    }

    #[tokio::test]
    async fn uri_too_long_keeps_partial_results() {
        let router = Router::new().route(
            "/api/v1/channels/UClong/videos",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                if params.contains_key("continuation") {
                    (StatusCode::URI_TOO_LONG, Json(json!({})))
                } else {
                    (StatusCode::OK, Json(videos(0..10, Some("tok-huge"))))
                }
            }),
        );
        let base = serve(router).await;

        let client = client_for(Some(base));
        let paged = client
            .fetch_channel_videos_paged("UClong", 30)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paged.videos.len(), 10);
        assert!(paged.pagination_limited);
        assert_eq!(paged.limit_reason, Some(LimitReason::UriTooLong));
    }

    #[tokio::test]
    async fn empty_and_missing_pages_stop_cleanly() {
        let router = Router::new()
            .route(
                "/api/v1/channels/UCempty/videos",
                get(|| async { Json(json!({"videos": []})) }),
            )
            .route(
                "/api/v1/channels/UCnodata/videos",
                get(|| async { Json(json!({"something": "else"})) }),
            );
        let base = serve(router).await;

        let client = client_for(Some(base));
        let paged = client
            .fetch_channel_videos_paged("UCempty", 30)
            .await
            .unwrap()
            .unwrap();
        assert!(paged.videos.is_empty());
        assert_eq!(paged.limit_reason, Some(LimitReason::NoVideos));

        let paged = client
            .fetch_channel_videos_paged("UCnodata", 30)
            .await
            .unwrap()
            .unwrap();
        assert!(paged.videos.is_empty());
        assert_eq!(paged.limit_reason, Some(LimitReason::NoData));
    }

    #[tokio::test]
    async fn channel_metadata_deserializes() {
        let router = Router::new().route(
            "/api/v1/channels/UCabc",
            get(|| async {
                Json(json!({
                    "author": "Channel",
                    "subCount": 12345,
                    "authorVerified": true,
                    "authorThumbnails": [
                        {"url": "/ggpht/avatar.jpg", "width": 176, "height": 176}
                    ]
                }))
            }),
        );
        let base = serve(router).await;

        let client = client_for(Some(base));
        let channel = client.get_channel("UCabc").await.unwrap().unwrap();
        assert_eq!(channel.sub_count, Some(12345));
        assert_eq!(channel.author_verified, Some(true));
        assert_eq!(channel.author_thumbnails.len(), 1);
    }

    #[test]
    fn relative_urls_resolve_against_the_instance() {
        assert_eq!(
            resolve_instance_url("https://iv.example.com", "/vi/x/maxres.jpg"),
            "https://iv.example.com/vi/x/maxres.jpg"
        );
        assert_eq!(
            resolve_instance_url("https://iv.example.com", "//yt3.ggpht.com/a.jpg"),
            "https://yt3.ggpht.com/a.jpg"
        );
        assert_eq!(
            resolve_instance_url("https://iv.example.com", "https://cdn.example.com/a.jpg"),
            "https://cdn.example.com/a.jpg"
        );
    }
}
