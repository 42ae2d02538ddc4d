use super::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Base delay for delivery retries, scaled by the backoff family.
const RETRY_BASE_MS: u64 = 1000;

/// Preview length for dropped-message logs.
const PREVIEW_CHARS: usize = 80;

/// One rendered line bound for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel: String,
    pub text: String,
}

/// Dispatcher tuning, lifted from `[limits]`.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub flood_interval: Duration,
    pub max_attempts: u32,
    pub backoff_factor: u32,
    pub backoff_cap: u32,
}

impl DispatcherConfig {
    pub fn from_limits(limits: &crate::config::Limits) -> Self {
        Self {
            flood_interval: limits.flood_interval(),
            max_attempts: limits.dispatch_max_attempts,
            backoff_factor: limits.backoff_factor,
            backoff_cap: limits.backoff_cap,
        }
    }
}

/// Producer side of the dispatcher.
///
/// `enqueue` never blocks and never fails the caller; once a message is
/// accepted here, delivery (or a loud drop) is the dispatcher's problem.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl DispatcherHandle {
    pub fn enqueue(&self, message: OutboundMessage) {
        if let Err(e) = self.tx.send(message) {
            tracing::warn!(
                channel = %e.0.channel,
                "Dispatcher is gone, dropping message"
            );
        }
    }
}

/// Start the dispatcher task.
///
/// The task owns one FIFO queue and one last-sent mark per channel. A
/// message leaves its queue only when the channel's flood window has
/// elapsed; ordering within a channel is never reordered by retries.
pub fn spawn_dispatcher<T: Transport>(
    transport: Arc<T>,
    config: DispatcherConfig,
    shutdown: watch::Receiver<bool>,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(run(transport, config, rx, shutdown));
    (DispatcherHandle { tx }, worker)
}

struct ChannelQueue {
    pending: VecDeque<String>,
    ready_at: Instant,
}

async fn run<T: Transport>(
    transport: Arc<T>,
    config: DispatcherConfig,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut queues: HashMap<String, ChannelQueue> = HashMap::new();

    loop {
        let next_ready = queues
            .values()
            .filter(|q| !q.pending.is_empty())
            .map(|q| q.ready_at)
            .min();

        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = rx.recv() => match msg {
                Some(OutboundMessage { channel, text }) => {
                    queues
                        .entry(channel)
                        .or_insert_with(|| ChannelQueue {
                            pending: VecDeque::new(),
                            ready_at: Instant::now(),
                        })
                        .pending
                        .push_back(text);
                }
                None => break,
            },
            _ = sleep_until_ready(next_ready), if next_ready.is_some() => {
                deliver_due(transport.as_ref(), &config, &mut queues).await;
            }
        }
    }

    let undelivered: usize = queues.values().map(|q| q.pending.len()).sum();
    if undelivered > 0 {
        tracing::warn!(undelivered, "Dispatcher stopping with queued messages");
    }
}

async fn sleep_until_ready(at: Option<Instant>) {
    if let Some(at) = at {
        tokio::time::sleep_until(at).await;
    }
}

/// Deliver at most one message per due channel, then reopen each channel's
/// flood window. Popping a single message per wake keeps per-channel FIFO
/// while the window does the pacing.
async fn deliver_due<T: Transport>(
    transport: &T,
    config: &DispatcherConfig,
    queues: &mut HashMap<String, ChannelQueue>,
) {
    let now = Instant::now();
    let due: Vec<String> = queues
        .iter()
        .filter(|(_, q)| !q.pending.is_empty() && q.ready_at <= now)
        .map(|(channel, _)| channel.clone())
        .collect();

    for channel in due {
        let Some(text) = queues
            .get_mut(&channel)
            .and_then(|q| q.pending.pop_front())
        else {
            continue;
        };

        deliver_with_retries(transport, config, &channel, &text).await;

        if let Some(q) = queues.get_mut(&channel) {
            q.ready_at = Instant::now() + config.flood_interval;
        }
    }
}

async fn deliver_with_retries<T: Transport>(
    transport: &T,
    config: &DispatcherConfig,
    channel: &str,
    text: &str,
) {
    for attempt in 0..config.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(retry_delay(config, attempt)).await;
        }

        if let Err(e) = transport.ensure_connected().await {
            tracing::warn!(
                channel = %channel,
                attempt = attempt,
                error = %e,
                "Reconnect failed before delivery"
            );
            continue;
        }

        match transport.send_line(channel, text).await {
            Ok(()) => return,
            Err(e) => tracing::warn!(
                channel = %channel,
                attempt = attempt,
                error = %e,
                "Delivery attempt failed"
            ),
        }
    }

    tracing::error!(
        channel = %channel,
        preview = %preview(text),
        attempts = config.max_attempts,
        "Dropping message after repeated delivery failures"
    );
}

fn retry_delay(config: &DispatcherConfig, attempt: u32) -> Duration {
    let exp = attempt.min(config.backoff_cap);
    let mult = (config.backoff_factor as u64).saturating_pow(exp);
    Duration::from_millis(RETRY_BASE_MS.saturating_mul(mult))
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::transport::TransportError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records every delivered line with its (virtual) delivery instant.
    /// Can be told to fail the first N sends.
    struct RecordingTransport {
        sent: tokio::sync::Mutex<Vec<(String, String, Instant)>>,
        fail_remaining: AtomicU32,
    }

    impl RecordingTransport {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                sent: tokio::sync::Mutex::new(Vec::new()),
                fail_remaining: AtomicU32::new(fail_first),
            })
        }

        async fn sent(&self) -> Vec<(String, String, Instant)> {
            self.sent.lock().await.clone()
        }
    }

    impl Transport for RecordingTransport {
        async fn ensure_connected(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send_line(&self, channel: &str, text: &str) -> Result<(), TransportError> {
            if self.fail_remaining.load(Ordering::SeqCst) > 0 {
                self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Disconnected);
            }
            self.sent
                .lock()
                .await
                .push((channel.to_string(), text.to_string(), Instant::now()));
            Ok(())
        }
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            flood_interval: Duration::from_secs(1),
            max_attempts: 3,
            backoff_factor: 2,
            backoff_cap: 6,
        }
    }

    fn msg(channel: &str, text: &str) -> OutboundMessage {
        OutboundMessage {
            channel: channel.to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_within_a_channel() {
        let transport = RecordingTransport::new(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, worker) =
            spawn_dispatcher(Arc::clone(&transport), test_config(), shutdown_rx);

        handle.enqueue(msg("#a", "first"));
        handle.enqueue(msg("#a", "second"));
        handle.enqueue(msg("#a", "third"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        let sent = transport.sent().await;
        let texts: Vec<&str> = sent.iter().map(|(_, t, _)| t.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_window_spaces_same_channel_sends() {
        let transport = RecordingTransport::new(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, worker) =
            spawn_dispatcher(Arc::clone(&transport), test_config(), shutdown_rx);

        handle.enqueue(msg("#a", "one"));
        handle.enqueue(msg("#a", "two"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 2);
        let gap = sent[1].2.duration_since(sent[0].2);
        assert!(gap >= Duration::from_secs(1), "gap was {:?}", gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_do_not_block_each_other() {
        let transport = RecordingTransport::new(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, worker) =
            spawn_dispatcher(Arc::clone(&transport), test_config(), shutdown_rx);

        handle.enqueue(msg("#a", "a1"));
        handle.enqueue(msg("#b", "b1"));

        // Well under one flood interval: both channels should have sent.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 2);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_retries_then_succeeds() {
        let transport = RecordingTransport::new(2);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, worker) =
            spawn_dispatcher(Arc::clone(&transport), test_config(), shutdown_rx);

        handle.enqueue(msg("#a", "eventually"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "eventually");
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_dropped_after_max_attempts() {
        let transport = RecordingTransport::new(u32::MAX);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, worker) =
            spawn_dispatcher(Arc::clone(&transport), test_config(), shutdown_rx);

        handle.enqueue(msg("#a", "doomed"));
        handle.enqueue(msg("#a", "doomed too"));

        tokio::time::sleep(Duration::from_secs(300)).await;
        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        // Both messages were dropped, the worker survived.
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_worker_stop_does_not_panic() {
        let transport = RecordingTransport::new(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, worker) =
            spawn_dispatcher(Arc::clone(&transport), test_config(), shutdown_rx);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        // Worker is gone; enqueue logs and drops instead of failing.
        handle.enqueue(msg("#a", "late"));
    }

    #[test]
    fn test_retry_delay_growth_is_capped() {
        let config = DispatcherConfig {
            flood_interval: Duration::from_secs(1),
            max_attempts: 10,
            backoff_factor: 2,
            backoff_cap: 3,
        };
        assert_eq!(retry_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(retry_delay(&config, 3), Duration::from_secs(8));
        // Capped from here on.
        assert_eq!(retry_delay(&config, 4), Duration::from_secs(8));
        assert_eq!(retry_delay(&config, 9), Duration::from_secs(8));
    }
}
