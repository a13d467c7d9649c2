//! Statement-level retry through the public `Queryer` surface.

mod common;

use async_trait::async_trait;
use common::FakeConnector;
use sqlhook::config::DatabaseOptions;
use sqlhook::context::Context;
use sqlhook::db::{Backoff, Database, Prepared, Queryer, RetryPolicy, Retrying};
use sqlhook::error::{DbError, DbResult};
use sqlhook::hook::NoopHook;
use sqlhook::models::{ExecResult, Rows, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Fails the first `failures` calls with a connection error.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    fn next(&self) -> DbResult<u32> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err(DbError::connection(format!("attempt {n} failed"), "retry"))
        } else {
            Ok(n)
        }
    }
}

#[async_trait]
impl Queryer for Flaky {
    async fn exec(&self, _ctx: &Context, _query: &str, _args: &[Value]) -> DbResult<ExecResult> {
        let n = self.next()?;
        Ok(ExecResult {
            rows_affected: n as u64,
            last_insert_id: None,
        })
    }

    async fn query(&self, _ctx: &Context, _query: &str, _args: &[Value]) -> DbResult<Rows> {
        let n = self.next()?;
        Ok(Rows::new(
            vec!["attempt".into()],
            vec![vec![Value::Int(n as i64)]],
        ))
    }

    async fn prepare(&self, _ctx: &Context, _query: &str) -> DbResult<Prepared> {
        Err(DbError::unsupported("prepare"))
    }
}

fn policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts, Backoff::Fixed(Duration::from_millis(20)))
}

/// Scenario E
#[tokio::test(start_paused = true)]
async fn test_fails_twice_then_succeeds() {
    let retrying = Retrying::new(Flaky::new(2), policy(3));

    let res = retrying
        .exec(&Context::background(), "UPDATE t SET a = 1", &[])
        .await
        .unwrap();

    assert_eq!(res.rows_affected, 3);
    assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_returns_last_error() {
    let retrying = Retrying::new(Flaky::new(10), policy(3));

    let err = retrying
        .query(&Context::background(), "SELECT 1", &[])
        .await
        .unwrap_err();

    assert!(err.to_string().contains("attempt 3 failed"));
    assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_get_is_retried() {
    let retrying = Retrying::new(Flaky::new(1), policy(2));

    let row = retrying
        .get(&Context::background(), "SELECT 1", &[])
        .await
        .unwrap();

    assert_eq!(row.get_by_name("attempt"), Some(&Value::Int(2)));
}

#[tokio::test(start_paused = true)]
async fn test_incremental_backoff_waits_between_attempts() {
    let retrying = Retrying::new(
        Flaky::new(2),
        RetryPolicy::new(
            3,
            Backoff::Incremental {
                initial: Duration::from_millis(100),
                step: Duration::from_millis(100),
            },
        ),
    );

    let start = tokio::time::Instant::now();
    retrying
        .exec(&Context::background(), "UPDATE t SET a = 1", &[])
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_single_attempt_inside_transaction() {
    let connector = FakeConnector::full();
    let state = connector.state.clone();
    let db = Database::open(
        Arc::new(connector),
        Arc::new(NoopHook),
        DatabaseOptions::default(),
    )
    .unwrap();
    let retrying = Retrying::new(db.clone(), policy(5));

    let err = db
        .with_tx(&Context::background(), false, |ctx| {
            let retrying = retrying.clone();
            async move {
                retrying.exec(&ctx, "UPDATE FAIL", &[]).await?;
                Ok::<_, DbError>(())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Connection { .. }));
    assert_eq!(state.count("c1:exec_context:UPDATE FAIL"), 1);
    assert_eq!(state.count("c1:rollback"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_against_a_database() {
    let connector = FakeConnector::full();
    let state = connector.state.clone();
    let db = Database::open(
        Arc::new(connector),
        Arc::new(NoopHook),
        DatabaseOptions::default(),
    )
    .unwrap();
    let retrying = Retrying::new(db.clone(), policy(3));

    let err = retrying
        .exec(&Context::background(), "UPDATE FAIL", &[])
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Connection { .. }));
    // A connection error discards the connection, so each attempt dials anew
    assert_eq!(state.connects.load(Ordering::SeqCst), 3);
    let attempts = state
        .log()
        .iter()
        .filter(|e| e.ends_with(":exec_context:UPDATE FAIL"))
        .count();
    assert_eq!(attempts, 3);
}
