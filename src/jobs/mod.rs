//! Recurring order lifecycle jobs.
//!
//! Two passes run on a schedule: expiring unpaid bank-transfer orders and
//! confirming delivered orders nobody acknowledged.

pub mod auto_confirm;
pub mod expiry;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::{config::AppConfig, db::DbPool, db::RetryPolicy, events::EventSender};

pub use auto_confirm::run_auto_confirm_pass;
pub use expiry::run_expiry_pass;
pub use scheduler::{JobFuture, JobTask, Scheduler, TokioScheduler};

pub const EXPIRY_JOB: &str = "order_expiry";
pub const AUTO_CONFIRM_JOB: &str = "order_auto_confirm";

/// Outcome counts for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub selected: usize,
    pub succeeded: usize,
    /// Orders whose status moved on between selection and update
    pub skipped: usize,
    pub failed: usize,
}

impl JobReport {
    pub fn selected(selected: usize) -> Self {
        Self {
            selected,
            ..Self::default()
        }
    }

    pub fn log(&self, job: &str) {
        info!(
            job,
            selected = self.selected,
            succeeded = self.succeeded,
            skipped = self.skipped,
            failed = self.failed,
            "Job pass finished"
        );
    }
}

/// Everything the lifecycle jobs need.
#[derive(Clone)]
pub struct JobContext {
    pub db: Arc<DbPool>,
    pub retry: RetryPolicy,
    pub events: Arc<EventSender>,
    pub expiry_interval: Duration,
    pub auto_confirm_interval: Duration,
    pub auto_confirm_after: chrono::Duration,
}

impl JobContext {
    pub fn from_config(db: Arc<DbPool>, events: Arc<EventSender>, config: &AppConfig) -> Self {
        Self {
            db,
            retry: config.retry_policy(),
            events,
            expiry_interval: config.expiry_job_interval(),
            auto_confirm_interval: config.auto_confirm_job_interval(),
            auto_confirm_after: config.auto_confirm_after(),
        }
    }
}

/// Registers both lifecycle jobs with `scheduler`.
pub fn start(scheduler: &dyn Scheduler, ctx: JobContext) {
    let expiry_ctx = ctx.clone();
    scheduler.every(
        EXPIRY_JOB,
        ctx.expiry_interval,
        Arc::new(move || {
            let ctx = expiry_ctx.clone();
            let fut: JobFuture = Box::pin(async move {
                run_expiry_pass(&ctx.db, &ctx.retry, &ctx.events, Utc::now()).await
            });
            fut
        }),
    );

    let confirm_ctx = ctx.clone();
    scheduler.every(
        AUTO_CONFIRM_JOB,
        ctx.auto_confirm_interval,
        Arc::new(move || {
            let ctx = confirm_ctx.clone();
            let fut: JobFuture = Box::pin(async move {
                run_auto_confirm_pass(&ctx.db, &ctx.events, Utc::now(), ctx.auto_confirm_after)
                    .await
            });
            fut
        }),
    );
}
