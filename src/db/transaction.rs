/*!
 * Transaction Helper Utilities
 *
 * Transaction scoping plus the bounded, randomised retry used for optimistic
 * (compare-and-swap) updates.
 */

use metrics::{counter, histogram};
use rand::Rng;
use sea_orm::{DatabaseConnection, DatabaseTransaction, DbErr, TransactionError, TransactionTrait};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::ServiceError;

/// Type alias for boxed future used in transactions
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Bounded retry with a randomised pause between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and one-shot tools.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Picks a pause uniformly from `[min_backoff, max_backoff]`.
    pub fn backoff(&self) -> Duration {
        let min = self.min_backoff.as_millis() as u64;
        let max = self.max_backoff.as_millis() as u64;
        if max <= min {
            return self.min_backoff;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Execute a function within a database transaction
///
/// Commits when `f` returns `Ok`, rolls back otherwise. Connection-level
/// failures are converted into the caller's error type.
///
/// # Example
///
/// ```rust,ignore
/// let order = with_transaction(&db, |txn| {
///     Box::pin(async move {
///         let order = new_order.insert(txn).await?;
///         Ok::<_, ServiceError>(order)
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<F, T, E>(db: &DatabaseConnection, f: F) -> Result<T, E>
where
    F: for<'c> FnOnce(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, E>> + Send,
    T: Send,
    E: std::error::Error + From<DbErr> + Send,
{
    db.transaction::<F, T, E>(f).await.map_err(|e| match e {
        TransactionError::Connection(db_err) => E::from(db_err),
        TransactionError::Transaction(err) => err,
    })
}

/// Re-runs `f` while it fails with a retryable error and attempts remain.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff();
                counter!("storefront.retry.attempts", 1, "operation" => operation.to_string());
                warn!(
                    operation,
                    attempt,
                    error = %err,
                    "Attempt {} failed, retrying in {:?}",
                    attempt,
                    delay
                );
                sleep(delay).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    counter!("storefront.retry.exhausted", 1, "operation" => operation.to_string());
                    warn!(
                        operation,
                        attempts = attempt,
                        error = %err,
                        "Giving up after exhausting retries"
                    );
                }
                return Err(err);
            }
        }
    }
}

/// Runs `f` in a fresh transaction per attempt.
///
/// A lost compare-and-swap rolls the whole attempt back before the next one
/// starts, so partial work from a failed attempt is never visible.
pub async fn retryable_transaction<F, T>(
    db: &DatabaseConnection,
    policy: &RetryPolicy,
    operation: &str,
    f: F,
) -> Result<T, ServiceError>
where
    F: for<'c> Fn(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, ServiceError>> + Send + Sync,
    T: Send,
{
    let f = &f;
    with_retry(policy, operation, || async move {
        let start = Instant::now();
        let result = with_transaction(db, |txn| f(txn)).await;
        histogram!(
            "storefront.db.transaction.duration",
            start.elapsed(),
            "operation" => operation.to_string()
        );
        result
    })
    .await
}
