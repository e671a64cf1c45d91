//! Periodic execution with short-delay coalescing.
//!
//! Drives the link-state broadcast cadence: a regular timer guarantees
//! periodic refresh, while [`RepeatedExecutor::trigger_short`] pulls the next
//! fire forward so a burst of topology changes collapses into one broadcast.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Runs one action on a regular cadence, with a short-delay fast path.
///
/// After any fire the regular timer is re-armed. A `trigger_short` arms a
/// short-delay fire only if none is already pending and it would precede the
/// regular one; the short fire replaces the regular fire rather than adding
/// to it. Fires never overlap because the action is awaited in the timer
/// task itself.
pub struct RepeatedExecutor {
    trigger_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl RepeatedExecutor {
    /// Spawn the timer task around `action`.
    pub fn spawn<A>(regular_delay: Duration, short_delay: Duration, mut action: A) -> Self
    where
        A: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(8);
        let task = tokio::spawn(async move {
            let mut deadline = Instant::now() + regular_delay;
            let mut short_pending = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        action().await;
                        short_pending = false;
                        deadline = Instant::now() + regular_delay;
                    }
                    received = trigger_rx.recv() => match received {
                        Some(()) => {
                            if !short_pending {
                                let candidate = Instant::now() + short_delay;
                                if candidate < deadline {
                                    deadline = candidate;
                                    short_pending = true;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        Self { trigger_tx, task }
    }

    /// Request a coalesced short-delay fire.
    pub fn trigger_short(&self) {
        // A full queue means a trigger is already waiting; that is the
        // coalescing we want.
        let _ = self.trigger_tx.try_send(());
    }

    /// Stop the timer task. No further fires happen after this returns.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RepeatedExecutor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_executor(
        regular: Duration,
        short: Duration,
    ) -> (RepeatedExecutor, Arc<AtomicUsize>) {
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fires);
        let executor = RepeatedExecutor::spawn(regular, short, move || -> BoxFuture<'static, ()> {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        (executor, fires)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_on_the_regular_cadence() {
        let (_executor, fires) = counting_executor(
            Duration::from_secs(5),
            Duration::from_millis(500),
        );

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_triggers_coalesces_into_one_fire() {
        let (executor, fires) = counting_executor(
            Duration::from_secs(5),
            Duration::from_millis(500),
        );

        for _ in 0..10 {
            executor.trigger_short();
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);

        // The short fire replaced the regular one and re-armed it.
        tokio::time::sleep(Duration::from_millis(4600)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_close_to_regular_deadline_does_not_delay_it() {
        let (executor, fires) = counting_executor(
            Duration::from_secs(5),
            Duration::from_millis(500),
        );

        // 4.8s in, the regular fire at 5s is nearer than now + 500ms.
        tokio::time::sleep(Duration::from_millis(4800)).await;
        executor.trigger_short();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_fires() {
        let (executor, fires) = counting_executor(
            Duration::from_secs(1),
            Duration::from_millis(100),
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        executor.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }
}
