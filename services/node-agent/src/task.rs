//! Cancellable periodic tasks.
//!
//! Every background loop in the agent ticks on a tokio interval and stops
//! when the shared shutdown flag flips to `true` (or its sender is dropped).
//! Running on tokio time lets tests drive the loops with a paused clock.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Shortest period a task runs at; tokio tickers reject a zero period.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// When the first tick fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    Immediately,
    AfterPeriod,
}

/// Spawn `tick` every `period` until shutdown.
///
/// Ticks never overlap: a slow tick delays the next one instead of bursting
/// to catch up. A period below [`MIN_PERIOD`] is raised to it.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    first: FirstTick,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if period < MIN_PERIOD {
        warn!(task = name, period_ms = period.as_millis() as u64, "Period too short, clamping");
    }
    let period = period.max(MIN_PERIOD);

    tokio::spawn(async move {
        let start = match first {
            FirstTick::Immediately => Instant::now(),
            FirstTick::AfterPeriod => Instant::now() + period,
        };
        let mut interval = interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            task = name,
            period_ms = period.as_millis() as u64,
            "Starting periodic task"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(task = name, "Periodic task shutting down");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<()> + Send {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let counter = Arc::new(AtomicU32::new(0));

        let handle = spawn_periodic(
            "test",
            Duration::from_secs(1),
            FirstTick::Immediately,
            rx,
            counting(&counter),
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        tx.send(true).unwrap();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_period_skips_initial_tick() {
        let (_tx, rx) = watch::channel(false);
        let counter = Arc::new(AtomicU32::new(0));

        let _handle = spawn_periodic(
            "test",
            Duration::from_secs(1),
            FirstTick::AfterPeriod,
            rx,
            counting(&counter),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_is_clamped() {
        let (tx, rx) = watch::channel(false);
        let counter = Arc::new(AtomicU32::new(0));
        let handle = spawn_periodic(
            "test",
            Duration::ZERO,
            FirstTick::AfterPeriod,
            rx,
            counting(&counter),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_stops_task() {
        let (tx, rx) = watch::channel(false);
        let counter = Arc::new(AtomicU32::new(0));
        let handle = spawn_periodic(
            "test",
            Duration::from_secs(1),
            FirstTick::AfterPeriod,
            rx,
            counting(&counter),
        );

        drop(tx);
        handle.await.unwrap();
    }
}
