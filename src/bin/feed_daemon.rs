#![forbid(unsafe_code)]

//! Long-running daemon that keeps cached per-channel video feeds fresh:
//! fetch every watched channel, sweep expired data, sleep, repeat.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tubefeed_tools::feed::FeedFetcher;
use tubefeed_tools::security::ensure_not_root;
use tubefeed_tools::settings::SettingsStore;
use tubefeed_tools::store::FeedStore;

#[derive(Debug, Parser)]
#[command(name = "feed_daemon", about = "Keeps cached per-channel video feeds fresh")]
struct Args {
    /// Path to the feed database.
    #[arg(long, default_value = "data/feed.db")]
    db: PathBuf,

    /// Path to the JSON settings file.
    #[arg(long, default_value = "data/settings.json")]
    settings: PathBuf,

    /// Run a single fetch cycle plus cleanups, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("feed_daemon")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Arc::new(SettingsStore::load(&args.settings));
    let store = Arc::new(FeedStore::open(&args.db).await?);
    let fetcher = FeedFetcher::new(settings.clone(), store);

    info!(
        db = %args.db.display(),
        settings = %settings.path().display(),
        "feed daemon starting"
    );

    if args.once {
        let stats = fetcher.run_cycle().await?;
        fetcher.run_cleanups().await;
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            "single cycle complete"
        );
        return Ok(());
    }

    tokio::select! {
        _ = fetcher.run_loop() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, exiting");
        }
    }
    Ok(())
}
