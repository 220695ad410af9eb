#![forbid(unsafe_code)]

//! yt-dlp subprocess wrapper: the universal fallback backend.
//!
//! yt-dlp speaks every site but is slow and heavy, so it only runs when the
//! primary backend cannot serve a channel. Invocations are hard-limited by a
//! timeout and URLs are kept strictly separated from flags on the command
//! line so untrusted input can never be parsed as an option.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::security::is_valid_url;
use crate::settings::SettingsStore;

const STDERR_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum YtdlpError {
    #[error("yt-dlp timed out after {0}s")]
    Timeout(u64),
    #[error("yt-dlp failed: {0}")]
    Failed(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YtdlpThumbnail {
    pub url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// One `-j` output record. Field availability varies wildly between sites
/// and between flat and full extraction, so everything is optional.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YtdlpVideo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub uploader: Option<String>,
    pub channel_id: Option<String>,
    pub uploader_id: Option<String>,
    pub duration: Option<f64>,
    pub view_count: Option<i64>,
    pub timestamp: Option<i64>,
    pub upload_date: Option<String>,
    pub url: Option<String>,
    pub webpage_url: Option<String>,
    pub thumbnail: Option<String>,
    pub thumbnails: Vec<YtdlpThumbnail>,
    pub channel_follower_count: Option<i64>,
    pub channel_is_verified: Option<bool>,
}

/// Runs the configured yt-dlp executable with timeout enforcement.
pub struct YtdlpRunner {
    settings: Arc<SettingsStore>,
}

impl YtdlpRunner {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }

    /// Invokes yt-dlp as `{flags} -- {urls}` and returns stdout.
    ///
    /// Every URL is validated first and passed after a `--` sentinel, so a
    /// URL starting with `-` can neither pass validation nor be read as a
    /// flag. The child is killed if it outlives `ytdlp_timeout`.
    pub async fn run(&self, flags: &[&str], urls: &[&str]) -> Result<String, YtdlpError> {
        for url in urls {
            if !is_valid_url(url) {
                return Err(YtdlpError::Invalid(format!("refusing to pass URL: {url}")));
            }
        }
        let settings = self.settings.get();

        let mut cmd = Command::new(&settings.ytdlp_path);
        cmd.args(flags)
            .arg("--")
            .args(urls)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(
            Duration::from_secs(settings.ytdlp_timeout),
            cmd.output(),
        )
        .await
        .map_err(|_| YtdlpError::Timeout(settings.ytdlp_timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(YtdlpError::Failed(truncate(stderr.trim(), STDERR_LIMIT)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Lists a channel's newest videos. Flat extraction skips per-video page
    /// fetches and is much faster, at the cost of sparser records.
    pub async fn fetch_channel_videos(
        &self,
        channel_url: &str,
        max_videos: usize,
        flat: bool,
    ) -> Result<Vec<YtdlpVideo>, YtdlpError> {
        let items = format!("1:{max_videos}");
        let mut flags = vec!["-j"];
        if flat {
            flags.push("--flat-playlist");
        }
        flags.extend(["--no-warnings", "--playlist-items", items.as_str()]);
        let stdout = self.run(&flags, &[channel_url]).await?;
        Ok(parse_json_lines(&stdout))
    }

    /// Full-extracts a single video from the channel page; its record carries
    /// the channel-level fields (follower count, verified badge) that flat
    /// extraction omits.
    pub async fn channel_info(&self, channel_url: &str) -> Result<Option<YtdlpVideo>, YtdlpError> {
        let stdout = self
            .run(&["-j", "--no-warnings", "--playlist-items", "1"], &[channel_url])
            .await?;
        Ok(parse_json_lines(&stdout).into_iter().next())
    }
}

/// Parses `-j` output, one JSON object per line. Lines that fail to parse
/// (warnings that slipped through, partial writes) are skipped.
pub fn parse_json_lines(output: &str) -> Vec<YtdlpVideo> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<YtdlpVideo>(line) {
            Ok(video) => Some(video),
            Err(err) => {
                debug!(%err, "skipping unparseable output line");
                None
            }
        })
        .collect()
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::{TempDir, tempdir};

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp-stub");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn runner_with_stub(body: &str, timeout: u64) -> (TempDir, YtdlpRunner) {
        let dir = tempdir().unwrap();
        let stub = write_stub(dir.path(), body);
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")));
        let mut s = settings.get();
        s.ytdlp_path = stub.to_string_lossy().into_owned();
        s.ytdlp_timeout = timeout;
        settings.update(s).unwrap();
        (dir, YtdlpRunner::new(settings))
    }

    #[tokio::test]
    async fn parses_output_and_skips_malformed_lines() {
        let (_dir, runner) = runner_with_stub(
            r#"echo '{"id": "a1", "title": "first", "duration": 61.0}'
echo 'WARNING: not json at all'
echo '{"id": "a2", "title": "second", "view_count": 9}'"#,
            5,
        );
        let videos = runner
            .fetch_channel_videos("https://example.com/c/test", 10, true)
            .await
            .unwrap();
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].id.as_deref(), Some("a1"));
        assert_eq!(videos[1].view_count, Some(9));
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr() {
        let (_dir, runner) = runner_with_stub(r#"echo "ERROR: channel gone" >&2; exit 1"#, 5);
        let err = runner
            .fetch_channel_videos("https://example.com/c/test", 10, true)
            .await
            .unwrap_err();
        match err {
            YtdlpError::Failed(msg) => assert!(msg.contains("channel gone")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hung_process_is_killed_on_timeout() {
        let (_dir, runner) = runner_with_stub("sleep 30", 1);
        let err = runner
            .fetch_channel_videos("https://example.com/c/test", 10, true)
            .await
            .unwrap_err();
        assert!(matches!(err, YtdlpError::Timeout(1)));
    }

    #[tokio::test]
    async fn flag_like_urls_rejected_before_spawning() {
        // Nonexistent executable: reaching the spawn would produce Io.
        let dir = tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")));
        let mut s = settings.get();
        s.ytdlp_path = "/nonexistent/yt-dlp".into();
        settings.update(s).unwrap();
        let runner = YtdlpRunner::new(settings);

        let err = runner.run(&["-j"], &["--exec=true"]).await.unwrap_err();
        assert!(matches!(err, YtdlpError::Invalid(_)));
    }

    #[tokio::test]
    async fn urls_are_separated_from_flags() {
        let (_dir, runner) = runner_with_stub(r#"printf '%s\n' "$@""#, 5);
        let stdout = runner
            .run(
                &["-j", "--no-warnings", "--playlist-items", "1:5"],
                &["https://example.com/c/test"],
            )
            .await
            .unwrap();
        let args: Vec<&str> = stdout.lines().collect();
        assert_eq!(
            args,
            vec![
                "-j",
                "--no-warnings",
                "--playlist-items",
                "1:5",
                "--",
                "https://example.com/c/test"
            ]
        );
    }

    #[tokio::test]
    async fn channel_info_takes_the_first_record() {
        let (_dir, runner) = runner_with_stub(
            r#"echo '{"id": "a1", "channel_follower_count": 42, "channel_is_verified": true}'
echo '{"id": "a2"}'"#,
            5,
        );
        let info = runner
            .channel_info("https://www.youtube.com/channel/UCabc/videos")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.channel_follower_count, Some(42));
        assert_eq!(info.channel_is_verified, Some(true));
    }

    #[test]
    fn json_lines_parser_tolerates_empty_output() {
        assert!(parse_json_lines("").is_empty());
        assert!(parse_json_lines("\n\n").is_empty());
    }
}
