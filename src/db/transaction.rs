//! Transaction manager.
//!
//! [`Database::with_tx`] runs a body inside a transaction and commits or
//! rolls back exactly once. Races between context cancellation and the
//! final commit or rollback are classified as follows.
//!
//! Commit, after the body succeeded:
//! - context error from commit: [`DbError::CommitCanceled`]
//! - already finished while the context is done: [`DbError::AmbiguousCommit`]
//!   (the server-side outcome is unknown)
//! - already finished with a live context: [`DbError::CommitAborted`]
//! - anything else: [`DbError::Commit`]
//!
//! Rollback, after the body failed with `e`:
//! - `e` is a context error: no rollback is issued, the connection is
//!   discarded and `e` is returned unchanged
//! - rollback succeeds: `e`
//! - rollback finds the transaction already finished while the context is
//!   done: `e` joined with the context error
//! - any other rollback failure: `e` joined with the rollback error
//!
//! After-commit callbacks run in registration order only when the commit
//! succeeded.

use super::pool::{Database, PooledConn};
use super::{Prepared, Queryer, StmtOwner, exec};
use crate::context::Context;
use crate::driver::{Conn, Tx, TxOptions};
use crate::error::{DbError, DbResult};
use crate::hook::{Action, CallMeta, PendingAfter};
use crate::models::{ExecResult, Rows, Value};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::MutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Callback = Box<dyn FnOnce(&Context) + Send>;

/// Context value marking the active transaction.
#[derive(Clone)]
struct ActiveTx(Transaction);

struct TxShared {
    id: String,
    db: Database,
    /// Context the transaction was begun with
    ctx: Context,
    tx: Box<dyn Tx>,
    conn: tokio::sync::Mutex<Option<PooledConn>>,
    done: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

impl Drop for TxShared {
    fn drop(&mut self) {
        // A connection still held here never saw COMMIT or ROLLBACK
        if let Some(mut conn) = self.conn.get_mut().take() {
            conn.discard();
        }
    }
}

/// Handle to an open transaction. Cheap to clone.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<TxShared>,
}

impl Transaction {
    /// The transaction active in `ctx`, if any.
    pub fn from_context(ctx: &Context) -> Option<Transaction> {
        ctx.value::<ActiveTx>().map(|active| active.0.clone())
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn database(&self) -> &Database {
        &self.shared.db
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    /// Lock the transaction's connection for one statement.
    pub(crate) async fn conn(&self, ctx: &Context) -> DbResult<TxConn<'_>> {
        if self.is_done() {
            return Err(DbError::TxDone);
        }
        let guard = ctx.run(self.shared.conn.lock()).await?;
        if guard.is_none() {
            return Err(DbError::TxDone);
        }
        Ok(TxConn { guard })
    }

    async fn commit(&self) -> DbResult<()> {
        let s = &self.shared;
        if let Some(err) = s.ctx.err() {
            if self.is_done() {
                return Err(DbError::TxDone);
            }
            return Err(err.into());
        }
        if s.done.swap(true, Ordering::SeqCst) {
            return Err(DbError::TxDone);
        }
        let mut guard = s.conn.lock().await;
        let result = s.tx.commit().await;
        if let Some(mut conn) = guard.take() {
            conn.note(&result);
        }
        result
    }

    async fn rollback(&self) -> DbResult<()> {
        let s = &self.shared;
        if s.done.swap(true, Ordering::SeqCst) {
            return Err(DbError::TxDone);
        }
        let mut guard = s.conn.lock().await;
        let result = s.tx.rollback().await;
        if let Some(mut conn) = guard.take() {
            conn.note(&result);
        }
        result
    }

    /// Finish the transaction without issuing ROLLBACK: the connection is
    /// closed, which aborts the transaction server-side.
    async fn abandon(&self) -> bool {
        if self.shared.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(mut conn) = self.shared.conn.lock().await.take() {
            conn.discard();
        }
        warn!(tx_id = %self.id(), "Transaction abandoned, connection discarded");
        true
    }

    /// Synchronous variant of [`abandon`](Self::abandon) for drop paths.
    fn abandon_now(&self) {
        if self.shared.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.shared.conn.try_lock() {
            if let Some(mut conn) = guard.take() {
                conn.discard();
            }
        }
        warn!(tx_id = %self.id(), "Transaction dropped before finishing");
    }

    fn run_callbacks(&self, ctx: &Context) {
        let callbacks = std::mem::take(
            &mut *self
                .shared
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if !callbacks.is_empty() {
            debug!(tx_id = %self.id(), count = callbacks.len(), "Running after-commit callbacks");
        }
        for callback in callbacks {
            callback(ctx);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.shared.id)
            .field("done", &self.is_done())
            .finish()
    }
}

pub(crate) struct TxConn<'a> {
    guard: MutexGuard<'a, Option<PooledConn>>,
}

impl TxConn<'_> {
    pub(crate) fn get(&self) -> &dyn Conn {
        match self.guard.as_ref() {
            Some(conn) => conn.conn(),
            None => unreachable!("checked when the guard was taken"),
        }
    }
}

#[async_trait]
impl Queryer for Transaction {
    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<ExecResult> {
        let conn = self.conn(ctx).await?;
        exec::exec(ctx, conn.get(), query, args).await
    }

    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<Rows> {
        let conn = self.conn(ctx).await?;
        exec::query(ctx, conn.get(), query, args).await
    }

    async fn prepare(&self, ctx: &Context, query: &str) -> DbResult<Prepared> {
        let stmt = {
            let conn = self.conn(ctx).await?;
            exec::prepare(ctx, conn.get(), query).await?
        };
        Ok(Prepared::new(stmt, query, StmtOwner::Tx(self.clone())))
    }
}

/// Aborts the watcher and releases an unfinished transaction when
/// `with_tx` exits, including when its future is dropped.
struct TxGuard {
    tx: Transaction,
    watcher: JoinHandle<()>,
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        self.watcher.abort();
        self.tx.abandon_now();
    }
}

/// Queue `callback` to run after the active transaction commits.
///
/// # Panics
///
/// Panics when `ctx` carries no active transaction: registering a
/// callback outside a transaction is a programming error.
pub fn register_after_commit_callback<F>(ctx: &Context, callback: F)
where
    F: FnOnce(&Context) + Send + 'static,
{
    let Some(tx) = Transaction::from_context(ctx) else {
        panic!("register_after_commit_callback called outside of a transaction");
    };
    tx.shared
        .callbacks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(Box::new(callback));
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

impl Database {
    /// Run `body` in a transaction with default options.
    ///
    /// When `ctx` already carries a transaction, the call fails with
    /// [`DbError::TxExists`] unless `continue_active` is set, in which case
    /// `body` joins it. Only a transaction of this database can be joined.
    pub async fn with_tx<T, F, Fut>(&self, ctx: &Context, continue_active: bool, body: F) -> DbResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.with_tx_opts(ctx, continue_active, TxOptions::default(), body)
            .await
    }

    pub async fn with_tx_opts<T, F, Fut>(
        &self,
        ctx: &Context,
        continue_active: bool,
        opts: TxOptions,
        body: F,
    ) -> DbResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        if let Some(active) = Transaction::from_context(ctx) {
            if !continue_active {
                return Err(DbError::TxExists);
            }
            if !active.database().same(self) {
                return Err(DbError::invalid_input(format!(
                    "cannot join transaction {} of another database",
                    active.id()
                )));
            }
            debug!(tx_id = %active.id(), "Joining active transaction");
            return body(ctx.clone()).await;
        }

        let hook = self.hook();
        let tx_ctx = hook.before(ctx.with_call(CallMeta::new().action(Action::Tx)));
        let span = PendingAfter::new(hook, tx_ctx);
        let result = self.run_tx(span.ctx(), opts, body).await;
        span.finish(result.as_ref().err());
        result
    }

    async fn run_tx<T, F, Fut>(&self, ctx: &Context, opts: TxOptions, body: F) -> DbResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut conn = self.acquire(ctx).await?;
        let driver_tx = match exec::begin(ctx, conn.conn(), opts).await {
            Ok(tx) => tx,
            Err(e) => {
                conn.note_err(&e);
                return Err(e);
            }
        };

        let tx = Transaction {
            shared: Arc::new(TxShared {
                id: generate_transaction_id(),
                db: self.clone(),
                ctx: ctx.clone(),
                tx: driver_tx,
                conn: tokio::sync::Mutex::new(Some(conn)),
                done: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        };
        info!(
            tx_id = %tx.id(),
            driver = %self.driver_name(),
            isolation = ?opts.isolation,
            read_only = opts.read_only,
            "Transaction started"
        );

        let watcher = tokio::spawn({
            let tx = tx.clone();
            let ctx = ctx.clone();
            async move {
                ctx.done().await;
                tx.abandon().await;
            }
        });
        let _guard = TxGuard {
            tx: tx.clone(),
            watcher,
        };

        let body_ctx = ctx.with_value(ActiveTx(tx.clone()));
        match body(body_ctx.clone()).await {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    info!(tx_id = %tx.id(), "Transaction committed");
                    tx.run_callbacks(&body_ctx);
                    Ok(value)
                }
                Err(e) => Err(classify_commit(&tx, ctx, e)),
            },
            Err(e) => Err(fail_tx(&tx, ctx, e).await),
        }
    }
}

async fn fail_tx(tx: &Transaction, ctx: &Context, err: DbError) -> DbError {
    if err.is_context() {
        tx.abandon().await;
        info!(tx_id = %tx.id(), error = %err, "Transaction body canceled, rollback skipped");
        return err;
    }
    // Cancellation already tore the transaction down
    if let Some(cause) = ctx.err() {
        tx.abandon().await;
        info!(tx_id = %tx.id(), error = %err, "Transaction context done, rollback skipped");
        return DbError::Rollback {
            cause: Box::new(err),
            rollback: Box::new(DbError::Context(cause)),
        };
    }
    match tx.rollback().await {
        Ok(()) => {
            info!(tx_id = %tx.id(), error = %err, "Transaction rolled back");
            err
        }
        Err(rb) => {
            warn!(tx_id = %tx.id(), error = %err, rollback_error = %rb, "Rollback failed");
            let rollback = match ctx.err() {
                Some(cause) if rb.is_tx_done() => DbError::Context(cause),
                _ => rb,
            };
            DbError::Rollback {
                cause: Box::new(err),
                rollback: Box::new(rollback),
            }
        }
    }
}

fn classify_commit(tx: &Transaction, ctx: &Context, err: DbError) -> DbError {
    let classified = if matches!(err, DbError::Context(_)) {
        DbError::CommitCanceled {
            source: Box::new(err),
        }
    } else if err.is_tx_done() {
        match ctx.err() {
            Some(context) => DbError::AmbiguousCommit { context },
            None => DbError::CommitAborted,
        }
    } else {
        DbError::Commit {
            source: Box::new(err),
        }
    };
    warn!(tx_id = %tx.id(), error = %classified, "Transaction commit failed");
    classified
}
