use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::JobReport;
use crate::{db::transaction::BoxFuture, errors::ServiceError};

pub type JobFuture = BoxFuture<'static, Result<JobReport, ServiceError>>;

/// A job body; called once per tick.
pub type JobTask = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Runs named jobs on a fixed period until shut down.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn every(&self, name: &'static str, period: Duration, task: JobTask);

    /// Stops every schedule and waits for in-flight ticks to finish.
    async fn shutdown(&self);
}

/// Scheduler backed by `tokio::time::interval`.
///
/// Every tick runs in its own task, so an error or a panic is logged and the
/// next tick still fires. The first tick fires one period after registration.
pub struct TokioScheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    fn every(&self, name: &'static str, period: Duration, task: JobTask) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(job = name, period_secs = period.as_secs_f64(), "Job scheduled");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!(job = name, "Job tick");
                        match tokio::spawn(task()).await {
                            Ok(Ok(report)) => {
                                debug!(job = name, ?report, "Job tick finished");
                            }
                            Ok(Err(e)) => {
                                error!(job = name, error = %e, "Job tick failed");
                            }
                            Err(join_err) if join_err.is_panic() => {
                                error!(job = name, "Job tick panicked");
                            }
                            Err(join_err) => {
                                warn!(job = name, error = %join_err, "Job tick cancelled");
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(job = name, "Job stopped");
        });

        match self.handles.lock() {
            Ok(mut handles) => handles.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduled job ended abnormally");
            }
        }
    }
}
