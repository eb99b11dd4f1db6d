//! Watch Debouncer.
//!
//! Watch events only fire a [`Trigger`]; the plugin loop waits on the
//! [`Debouncer`] until events stop arriving for the settle time, so a burst
//! of events results in a single pass.

use std::time::Duration;
use tokio::sync::mpsc;

/// Signals that watched state changed. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    pub fn fire(&self) {
        // A full channel already holds an undelivered signal.
        let _ = self.tx.try_send(());
    }
}

/// Receiving side of a [`Trigger`].
#[derive(Debug)]
pub struct Debouncer {
    rx: mpsc::Receiver<()>,
    settle: Duration,
}

/// Create a connected trigger and debouncer.
pub fn channel(settle: Duration) -> (Trigger, Debouncer) {
    let (tx, rx) = mpsc::channel(1);
    (Trigger { tx }, Debouncer { rx, settle })
}

impl Debouncer {
    /// Wait for a trigger followed by `settle` without another one.
    ///
    /// Returns false once every [`Trigger`] is dropped and nothing is pending.
    pub async fn settled(&mut self) -> bool {
        if self.rx.recv().await.is_none() {
            return false;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settle) => return true,
                next = self.rx.recv() => {
                    if next.is_none() {
                        return true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Instant, sleep};

    #[tokio::test(start_paused = true)]
    async fn test_burst_yields_one_settle_after_last_event() {
        let (trigger, mut debouncer) = channel(Duration::from_secs(5));
        let start = Instant::now();

        let burst = trigger.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                burst.fire();
                sleep(Duration::from_secs(2)).await;
            }
        });

        assert!(debouncer.settled().await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(9), "settled after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "settled after {elapsed:?}");
        drop(trigger);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_signal_is_not_lost() {
        let (trigger, mut debouncer) = channel(Duration::from_secs(1));
        trigger.fire();
        trigger.fire();

        let start = Instant::now();
        assert!(debouncer.settled().await);
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_triggers_end_the_debouncer() {
        let (trigger, mut debouncer) = channel(Duration::from_secs(1));
        trigger.fire();
        drop(trigger);

        // The pending signal still settles, then the channel is closed.
        assert!(debouncer.settled().await);
        assert!(!debouncer.settled().await);
    }
}
