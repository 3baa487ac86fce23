use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, error, warn};

use crate::metrics::SWEPT_ENTRIES;
use crate::rate_limit::RateLimiter;

/// Background task that periodically drops expired entries from a limiter.
///
/// Dropping the handle without calling [`Sweeper::shutdown`] also stops the
/// task at its next wake-up.
pub struct Sweeper {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn(limiter: Arc<RateLimiter>, every: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let every = every.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick fires immediately
            ticker.tick().await;

            debug!("Rate limit sweeper started (interval: {:?})", every);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => sweep_once(&limiter),
                }
            }

            debug!("Rate limit sweeper stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Rate limit sweeper ended abnormally");
        }
    }
}

fn sweep_once(limiter: &RateLimiter) {
    match limiter.sweep() {
        Ok(removed) => {
            SWEPT_ENTRIES.inc_by(removed as f64);
            debug!(removed, remaining = limiter.len(), "Rate limit sweep completed");
        }
        Err(e) => error!(error = %e, "Rate limit sweep failed"),
    }
}
