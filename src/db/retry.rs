//! Statement-level retry.
//!
//! [`Retrying`] wraps any [`Queryer`] and re-issues individual statements
//! under a [`RetryPolicy`]. It never retries inside a transaction: when the
//! context carries an active transaction every call is a single attempt, and
//! the caller is expected to retry the whole transaction body instead.

use super::{Prepared, Queryer};
use super::transaction::Transaction;
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, Row, Rows, Value};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `initial` before the second attempt, growing by `step` per attempt.
    Incremental { initial: Duration, step: Duration },
}

impl Backoff {
    /// Delay after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Incremental { initial, step } => {
                initial.saturating_add(step.saturating_mul(attempt.saturating_sub(1)))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed(Duration::from_millis(DEFAULT_RETRY_DELAY_MS))
    }
}

type RetryPredicate = Arc<dyn Fn(&DbError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    retry_if: Option<RetryPredicate>,
}

impl RetryPolicy {
    /// `max_attempts` counts the first call; values below 1 are raised to 1.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retry_if: None,
        }
    }

    /// Only retry errors for which `pred` holds. Without a predicate every
    /// error except a context error is retried.
    pub fn retry_if<F>(mut self, pred: F) -> Self
    where
        F: Fn(&DbError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(pred));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    fn should_retry(&self, err: &DbError) -> bool {
        if err.is_context() {
            return false;
        }
        self.retry_if.as_ref().is_none_or(|pred| pred(err))
    }

    /// Run `op` until it succeeds, the attempts are exhausted, or it fails
    /// with an error that is not retried. Returns the last result.
    pub async fn run<T, F, Fut>(&self, ctx: &Context, mut op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if attempt >= self.max_attempts || !self.should_retry(&err) {
                return Err(err);
            }
            let delay = self.backoff.delay(attempt);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Statement failed, retrying"
            );
            ctx.run(tokio::time::sleep(delay)).await?;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_ATTEMPTS, Backoff::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retry_if", &self.retry_if.is_some())
            .finish()
    }
}

/// A [`Queryer`] whose statements are retried under a policy.
#[derive(Debug, Clone)]
pub struct Retrying<Q> {
    inner: Q,
    policy: RetryPolicy,
}

impl<Q: Queryer> Retrying<Q> {
    pub fn new(inner: Q, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt<T, F, Fut>(&self, ctx: &Context, op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        if Transaction::from_context(ctx).is_some() {
            let mut op = op;
            return op().await;
        }
        self.policy.run(ctx, op).await
    }
}

#[async_trait]
impl<Q: Queryer> Queryer for Retrying<Q> {
    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<ExecResult> {
        self.attempt(ctx, || self.inner.exec(ctx, query, args))
            .await
    }

    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<Rows> {
        self.attempt(ctx, || self.inner.query(ctx, query, args))
            .await
    }

    async fn get(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<Row> {
        self.attempt(ctx, || self.inner.get(ctx, query, args)).await
    }

    async fn prepare(&self, ctx: &Context, query: &str) -> DbResult<Prepared> {
        self.attempt(ctx, || self.inner.prepare(ctx, query)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_incremental_backoff() {
        let backoff = Backoff::Incremental {
            initial: Duration::from_millis(100),
            step: Duration::from_millis(50),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(200));
        assert_eq!(
            Backoff::Fixed(Duration::from_secs(1)).delay(5),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_attempts_floor_is_one() {
        assert_eq!(RetryPolicy::new(0, Backoff::default()).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(10)));
        let out = policy
            .run(&Context::background(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(DbError::timeout("query", 1))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Backoff::default());
        let out: DbResult<()> = policy
            .run(&Context::background(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(DbError::internal(format!("attempt {}", n)))
            })
            .await;
        assert_eq!(out.unwrap_err().to_string(), "Internal error: attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_context_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Backoff::default());
        let out: DbResult<()> = policy
            .run(&Context::background(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DbError::Context(ContextError::Canceled))
            })
            .await;
        assert!(out.unwrap_err().is_canceled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_predicate_limits_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Backoff::default()).retry_if(DbError::is_retryable);
        let out: DbResult<()> = policy
            .run(&Context::background(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DbError::RowNotFound)
            })
            .await;
        assert!(matches!(out, Err(DbError::RowNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleep_honors_cancellation() {
        let (ctx, cancel) = Context::background().with_cancel();
        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::from_secs(60)));
        let out: DbResult<()> = policy
            .run(&ctx, || {
                cancel.cancel();
                async { Err(DbError::timeout("query", 1)) }
            })
            .await;
        assert!(out.unwrap_err().is_canceled());
    }
}
