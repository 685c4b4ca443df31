use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveDebounceConfig {
    /// Quiet period after the last edit before the write is issued.
    pub delay: Duration,
    /// Wait before the first retry of a failed write; doubles per retry.
    pub retry_backoff: Duration,
    pub retry_ceiling: Duration,
}

impl Default for SaveDebounceConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(800),
            retry_backoff: Duration::from_secs(1),
            retry_ceiling: Duration::from_secs(30),
        }
    }
}

/// What a flush reports back to the debouncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Settled,
    /// The write failed transiently and should be attempted again.
    Retry,
}

fn retry_delay(config: &SaveDebounceConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    config
        .retry_backoff
        .saturating_mul(1_u32 << exponent)
        .min(config.retry_ceiling)
}

/// Collapses bursts of edits into one flush after a quiet period and
/// retries failed flushes with exponential backoff.
#[derive(Debug)]
pub struct SaveDebouncer {
    touch_tx: Option<mpsc::UnboundedSender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SaveDebouncer {
    pub fn start<F, Fut>(config: SaveDebounceConfig, flush: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = FlushOutcome> + Send + 'static,
    {
        let (touch_tx, touch_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_debounce_loop(config, touch_rx, flush));
        Self {
            touch_tx: Some(touch_tx),
            task: Some(task),
        }
    }

    /// Restarts the quiet period.
    pub fn touch(&self) {
        if let Some(touch_tx) = &self.touch_tx {
            let _ = touch_tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Stops the debouncer. A pending burst is flushed once before the task
    /// exits; a pending retry is attempted once more.
    pub async fn shutdown(&mut self) {
        self.touch_tx.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Waits until `period` passes without a touch. Returns `true` when the
/// touch channel closed while waiting.
async fn wait_quiet(touch_rx: &mut mpsc::UnboundedReceiver<()>, period: Duration) -> bool {
    loop {
        tokio::select! {
            next = touch_rx.recv() => {
                if next.is_none() {
                    return true;
                }
            }
            _ = tokio::time::sleep(period) => return false,
        }
    }
}

async fn run_debounce_loop<F, Fut>(
    config: SaveDebounceConfig,
    mut touch_rx: mpsc::UnboundedReceiver<()>,
    mut flush: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = FlushOutcome>,
{
    while touch_rx.recv().await.is_some() {
        let mut closed = wait_quiet(&mut touch_rx, config.delay).await;
        let mut attempt = 0_u32;
        while flush().await == FlushOutcome::Retry && !closed {
            attempt = attempt.saturating_add(1);
            closed = wait_quiet(&mut touch_rx, retry_delay(&config, attempt)).await;
        }
        if closed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{retry_delay, FlushOutcome, SaveDebounceConfig, SaveDebouncer};

    /// Counts flushes; the first `failures` flushes ask for a retry.
    fn counting_debouncer(delay_ms: u64, failures: usize) -> (SaveDebouncer, Arc<AtomicUsize>) {
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushes);
        let debouncer = SaveDebouncer::start(
            SaveDebounceConfig {
                delay: Duration::from_millis(delay_ms),
                ..SaveDebounceConfig::default()
            },
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        FlushOutcome::Retry
                    } else {
                        FlushOutcome::Settled
                    }
                }
            },
        );
        (debouncer, flushes)
    }

    #[test]
    fn unit_retry_delay_doubles_up_to_ceiling() {
        let config = SaveDebounceConfig {
            retry_backoff: Duration::from_secs(1),
            retry_ceiling: Duration::from_secs(5),
            ..SaveDebounceConfig::default()
        };
        assert_eq!(retry_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(retry_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(retry_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(retry_delay(&config, 4), Duration::from_secs(5));
        assert_eq!(retry_delay(&config, 40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn functional_burst_of_edits_collapses_into_one_flush() {
        let (mut debouncer, flushes) = counting_debouncer(800, 0);
        for _ in 0..5 {
            debouncer.touch();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(flushes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 1);

        debouncer.touch();
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 2);
        debouncer.shutdown().await;
        assert!(!debouncer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn functional_failed_flush_is_retried_with_backoff() {
        let (mut debouncer, flushes) = counting_debouncer(800, 2);
        debouncer.touch();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 3);
        debouncer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unit_shutdown_flushes_pending_burst_once() {
        let (mut debouncer, flushes) = counting_debouncer(800, 0);
        debouncer.touch();
        debouncer.shutdown().await;
        assert_eq!(flushes.load(Ordering::SeqCst), 1);

        let (mut idle, idle_flushes) = counting_debouncer(800, 0);
        idle.shutdown().await;
        assert_eq!(idle_flushes.load(Ordering::SeqCst), 0);

        let (mut failing, failing_flushes) = counting_debouncer(800, usize::MAX);
        failing.touch();
        failing.shutdown().await;
        assert_eq!(failing_flushes.load(Ordering::SeqCst), 1);
    }
}
