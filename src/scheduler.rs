//! Per-feed polling.
//!
//! One tokio task per configured feed, so no two polls of the same feed id
//! ever overlap while independent feeds proceed concurrently. Each task owns
//! its feed's [`SeenCache`] and poll timing; fetch and parse failures back
//! off the next poll, store failures disable the feed.
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{FeedConfig, Limits};
use crate::feed::{parse_entries, Entry, FetchError, Fetcher, ParseError};
use crate::format;
use crate::irc::{DispatcherHandle, OutboundMessage};
use crate::storage::{Database, SeenCache, StoreError};
use crate::summarizer::Summarizer;

/// How long feed tasks get to finish their in-flight cycle after shutdown
/// is signalled before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ============================================================================
// Error Types
// ============================================================================

/// One poll cycle's failure.
///
/// Fetch and parse failures are transient and feed the backoff counter.
/// Store failures are not: a feed that cannot record what it announced
/// must stop announcing.
#[derive(Debug, Error)]
enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler {
    db: Database,
    fetcher: Fetcher,
    dispatcher: DispatcherHandle,
    summarizer: Option<Arc<Summarizer>>,
    limits: Limits,
    feeds: Vec<FeedConfig>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        fetcher: Fetcher,
        dispatcher: DispatcherHandle,
        summarizer: Option<Arc<Summarizer>>,
        limits: Limits,
        feeds: Vec<FeedConfig>,
    ) -> Self {
        Self {
            db,
            fetcher,
            dispatcher,
            summarizer,
            limits,
            feeds,
        }
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Spawns one task per feed, then waits for the signal. On shutdown,
    /// feed tasks finish their in-flight poll cycle within a bounded grace
    /// period; stragglers are aborted. An empty feed list simply idles.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for feed in self.feeds {
            let task = FeedTask {
                feed,
                db: self.db.clone(),
                fetcher: self.fetcher.clone(),
                dispatcher: self.dispatcher.clone(),
                summarizer: self.summarizer.clone(),
                limits: self.limits.clone(),
            };
            tasks.push(tokio::spawn(task.run(shutdown.clone())));
        }
        tracing::info!(feeds = tasks.len(), "Scheduler started");

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("Shutdown grace period expired, aborting feed tasks");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

// ============================================================================
// Feed Task
// ============================================================================

struct FeedTask {
    feed: FeedConfig,
    db: Database,
    fetcher: Fetcher,
    dispatcher: DispatcherHandle,
    summarizer: Option<Arc<Summarizer>>,
    limits: Limits,
}

impl FeedTask {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let seen = match self.db.load_seen(&self.feed.id).await {
            Ok(seen) => seen,
            Err(e) => {
                tracing::error!(
                    feed = %self.feed.id,
                    error = %e,
                    "Dedup store unreadable, feed disabled"
                );
                return;
            }
        };

        // A feed with no recorded entries is being watched for the first
        // time: its current backlog is recorded without being announced,
        // so deployment does not flood the channels.
        let mut suppress_backlog = seen.is_empty();
        let mut cache = SeenCache::new(seen);
        let mut failures: u32 = 0;

        tracing::info!(
            feed = %self.feed.id,
            known_entries = cache.len(),
            "Feed task started"
        );

        loop {
            match self.poll(&mut cache, suppress_backlog).await {
                Ok(announced) => {
                    failures = 0;
                    suppress_backlog = false;
                    tracing::debug!(feed = %self.feed.id, announced, "Poll complete");
                }
                Err(PollError::Store(e)) => {
                    tracing::error!(
                        feed = %self.feed.id,
                        error = %e,
                        "Dedup store write failed, feed disabled"
                    );
                    return;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        feed = %self.feed.id,
                        error = %e,
                        consecutive_failures = failures,
                        "Poll failed"
                    );
                }
            }

            let delay = backoff_delay(
                self.feed.poll_interval(),
                self.limits.backoff_factor,
                self.limits.backoff_cap,
                failures,
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!(feed = %self.feed.id, "Feed task stopped");
    }

    /// One fetch-parse-announce-record cycle. Returns the number of entries
    /// announced.
    async fn poll(&self, cache: &mut SeenCache, suppress: bool) -> Result<usize, PollError> {
        let bytes = self.fetcher.fetch(&self.feed.url).await?;
        let entries = parse_entries(&bytes)?;

        let mut announced = 0;
        for entry in entries {
            if !cache.is_new(&entry.id) {
                continue;
            }
            let now = Utc::now();

            if !suppress
                && self.feed.wants(&entry.title)
                && within_age(entry.published, self.limits.max_entry_age_secs, now)
            {
                self.announce(&entry).await;
                announced += 1;
            }

            // Enqueue happens before the record lands. A crash between the
            // two re-announces this entry on restart, which keeps delivery
            // at-least-once instead of silently losing it.
            self.db.record(&self.feed.id, &entry.id, now).await?;
            cache.insert(entry.id);
        }

        Ok(announced)
    }

    async fn announce(&self, entry: &Entry) {
        let summary = self.summary_for(entry).await;
        let lines = format::format_entry(&self.feed.id, entry, summary.as_deref());
        for channel in &self.feed.channels {
            for line in &lines {
                self.dispatcher.enqueue(OutboundMessage {
                    channel: channel.clone(),
                    text: line.clone(),
                });
            }
        }
    }

    /// Remote summary when configured and working, body excerpt otherwise.
    async fn summary_for(&self, entry: &Entry) -> Option<String> {
        if entry.body_text.trim().is_empty() {
            return None;
        }
        if let Some(summarizer) = &self.summarizer {
            match summarizer.summarize(&entry.title, &entry.body_text).await {
                Ok(summary) => return Some(summary),
                Err(e) => {
                    tracing::warn!(
                        feed = %self.feed.id,
                        error = %e,
                        "Summarizer failed, falling back to body excerpt"
                    );
                }
            }
        }
        format::fallback_summary(&entry.body_text)
    }
}

// ============================================================================
// Poll Timing
// ============================================================================

/// Delay until the next poll: the base interval grown by
/// `factor^min(failures, cap)`.
fn backoff_delay(base: Duration, factor: u32, cap: u32, failures: u32) -> Duration {
    if failures == 0 {
        return base;
    }
    let multiplier = (factor as u64).saturating_pow(failures.min(cap));
    base.saturating_mul(u32::try_from(multiplier).unwrap_or(u32::MAX))
}

/// Whether an entry's published time is inside the announcement window.
/// `max_age_secs == 0` disables the window; entries without a published
/// time always pass.
fn within_age(published: Option<DateTime<Utc>>, max_age_secs: u64, now: DateTime<Utc>) -> bool {
    if max_age_secs == 0 {
        return true;
    }
    match published {
        None => true,
        Some(published) => {
            let age = now.signed_duration_since(published).num_seconds();
            age <= max_age_secs as i64
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
