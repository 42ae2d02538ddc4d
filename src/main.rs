use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use feedwire::config::Config;
use feedwire::feed::Fetcher;
use feedwire::irc::{spawn_dispatcher, DispatcherConfig, IrcClient, IrcSettings};
use feedwire::scheduler::Scheduler;
use feedwire::storage::Database;
use feedwire::summarizer::Summarizer;

#[derive(Parser, Debug)]
#[command(name = "feedwire", about = "Announce new RSS/Atom entries to IRC channels")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, value_name = "FILE", default_value = "feedwire.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    tracing::info!(
        feeds = config.feeds.len(),
        server = %config.irc.server,
        "Configuration loaded"
    );

    // The dedup store gates everything else: without it, every restart
    // would replay announcement history into the channels.
    let db = Database::open(&config.db_path)
        .await
        .with_context(|| format!("Failed to open dedup store at {}", config.db_path))?;

    let mut channels: Vec<String> = config
        .feeds
        .iter()
        .flat_map(|feed| feed.channels.iter().cloned())
        .collect();
    channels.sort();
    channels.dedup();

    let settings = IrcSettings::from_config(&config.irc, channels);
    let client = IrcClient::connect(settings)
        .await
        .context("Failed to connect to IRC")?;
    let client = Arc::new(client);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (dispatcher, dispatcher_task) = spawn_dispatcher(
        client,
        DispatcherConfig::from_limits(&config.limits),
        shutdown_rx.clone(),
    );

    let summarizer = Summarizer::from_config(&config.summarizer).map(Arc::new);
    if summarizer.is_none() {
        tracing::info!("No summarizer API key configured, announcements use body excerpts");
    }

    let fetcher = Fetcher::new(config.limits.fetch_timeout());
    let scheduler = Scheduler::new(
        db,
        fetcher,
        dispatcher,
        summarizer,
        config.limits.clone(),
        config.feeds.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_task.await;
    let _ = dispatcher_task.await;
    tracing::info!("Goodbye");
    Ok(())
}
