//! Background queue draining.

use crate::Context;
use crate::processor::process_pending_queue_once;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use verve_cache::CacheEvent;

/// Runs queue passes whenever the queue changes, and on an interval so that
/// entries backing off get their retry.
#[derive(Debug, Clone)]
pub struct QueueWorker {
    ctx: Context,
    interval: Duration,
}
impl QueueWorker {
    pub fn new(ctx: Context, interval: Duration) -> Self {
        Self { ctx, interval }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Drain until `cancel` fires. A pass in flight is finished first, so no
    /// entry is left `processing`.
    #[instrument(skip_all, fields(interval = ?self.interval))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut events = self.ctx.repo.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("queue worker started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(CacheEvent::QueueChanged) | Err(RecvError::Lagged(_)) => {},
                    Ok(_) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {},
            }
            self.drain().await;
        }
        info!("queue worker stopped");
    }

    async fn drain(&self) {
        match process_pending_queue_once(&self.ctx).await {
            Ok(report) if !report.is_idle() => debug!(?report, "drained"),
            Ok(_) => {},
            Err(err) => error!("queue pass aborted: {}", crate::processor::error_chain(&err)),
        }
    }
}
