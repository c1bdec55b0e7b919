//! Background expiry of reply correlations.
//!
//! Reply deadlines are not timers: expired correlations sit in the bus until
//! something sweeps them. [`spawn_reply_sweeper`] does that on a fixed
//! period until the shutdown flag is raised.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::Bus;

/// Something holding reply deadlines.
pub trait ReplySweep: Send + Sync + 'static {
    /// Expires every overdue correlation and returns how many there were.
    fn sweep_expired(&self) -> usize;
}

impl ReplySweep for Bus {
    fn sweep_expired(&self) -> usize {
        self.sweep_expired_replies()
    }
}

/// Spawns a task sweeping `target` every `period`.
///
/// The task exits on the first tick after `shutdown` is set.
pub fn spawn_reply_sweeper<S: ReplySweep>(
    target: Arc<S>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            if shutdown.load(Ordering::Acquire) {
                info!("Reply sweeper shutting down");
                break;
            }

            let expired = target.sweep_expired();
            if expired > 0 {
                debug!(expired, "expired reply correlations swept");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Counter {
        sweeps: AtomicUsize,
    }

    impl ReplySweep for Counter {
        fn sweep_expired(&self) -> usize {
            self.sweeps.fetch_add(1, Ordering::Relaxed);
            0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_ticks_until_shutdown() {
        let counter = Arc::new(Counter::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_reply_sweeper(
            Arc::clone(&counter),
            Duration::from_millis(100),
            Arc::clone(&shutdown),
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(counter.sweeps.load(Ordering::Relaxed) >= 3);

        shutdown.store(true, Ordering::Release);
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.await.unwrap();
        let after = counter.sweeps.load(Ordering::Relaxed);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.sweeps.load(Ordering::Relaxed), after);
    }
}
