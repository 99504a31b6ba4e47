use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Never longer than the TTL, never shorter than a floor.
pub fn sweep_interval(ttl: Duration) -> Duration {
    ttl.min(MAX_SWEEP_INTERVAL).max(MIN_SWEEP_INTERVAL)
}

/// Background task that periodically runs a cleanup closure until stopped.
///
/// The task is only spawned when a Tokio runtime is present; without one the
/// sweeper is inert and `stop` is a no-op. Dropping the sweeper also ends the
/// task because the stop channel closes.
pub struct Sweeper {
    stop_tx: watch::Sender<bool>,
}

impl Sweeper {
    pub fn spawn<F>(name: &'static str, ttl: Duration, sweep: F) -> Self
    where
        F: Fn() -> usize + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        match Handle::try_current() {
            Ok(handle) if !ttl.is_zero() => {
                let period = sweep_interval(ttl);
                handle.spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                let removed = sweep();
                                if removed > 0 {
                                    debug!(sweeper = name, removed, "Expired entries swept");
                                }
                            }
                            changed = stop_rx.changed() => {
                                if changed.is_err() || *stop_rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!(sweeper = name, "Sweeper stopped");
                });
            }
            _ => debug!(sweeper = name, "No runtime or zero ttl, sweeper disabled"),
        }

        Self { stop_tx }
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }
}
