//! Recurring background work.
//!
//! A [`Tick`] is a unit of periodic work; a [`Scheduler`] decides when it runs.
//! Keeping the two apart lets tests call the work directly instead of waiting
//! on wall-clock time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodic work. Must not fail: errors are logged and left for the next tick.
#[async_trait]
pub trait Tick: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&self);
}

pub trait Scheduler {
    /// Run `task` now and then every `every` until the scheduler shuts down.
    fn on_tick(&self, task: Arc<dyn Tick>, every: Duration) -> JoinHandle<()>;
}

/// Tokio-interval scheduler. A tick that overruns delays the next one rather
/// than causing a burst.
#[derive(Debug, Default, Clone)]
pub struct IntervalScheduler {
    shutdown: CancellationToken,
}

impl IntervalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop every task started by this scheduler after its current tick.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Scheduler for IntervalScheduler {
    fn on_tick(&self, task: Arc<dyn Tick>, every: Duration) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(task = task.name(), every_secs = every.as_secs_f64(), "scheduled task started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        debug!(task = task.name(), "tick");
                        task.tick().await;
                    }
                }
            }
            info!(task = task.name(), "scheduled task stopped");
        })
    }
}
