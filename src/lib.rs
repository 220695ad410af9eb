#![forbid(unsafe_code)]

//! Shared library for the tubefeed daemon: a periodic, SSRF-hardened
//! ingestion pipeline that keeps a locally cached video feed per watched
//! channel, fed by an Invidious-compatible API with yt-dlp as the
//! universal fallback.

pub mod avatars;
pub mod feed;
pub mod invidious;
pub mod security;
pub mod settings;
pub mod store;
pub mod ytdlp;
