//! Pool of instrumented connections.
//!
//! [`Database`] hands out connections opened through a wrapped connector,
//! caps the number of open connections, retires connections past their
//! maximum lifetime and applies the configured search path to every new
//! physical connection before any caller statement runs on it.

use super::exec;
use super::transaction::Transaction;
use super::{Prepared, Queryer, StmtOwner};
use crate::config::{DatabaseConfig, DatabaseOptions};
use crate::context::Context;
use crate::driver::backend::SqlxConnector;
use crate::driver::{Conn, ConnCaps, Connector, WrappedConnector, wrap_connector};
use crate::error::{DbError, DbResult};
use crate::hook::Hook;
use crate::models::{ExecResult, Rows, Value};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// 0 means unlimited
    pub max_open: u32,
    pub open: u64,
    pub in_use: u64,
    pub idle: u64,
    /// Checkouts that had to wait for a free slot
    pub wait_count: u64,
    /// Connections closed for exceeding the maximum lifetime
    pub max_lifetime_closed: u64,
}

struct IdleConn {
    conn: Box<dyn Conn>,
    created: Instant,
}

pub(crate) struct Shared {
    connector: WrappedConnector,
    hook: Arc<dyn Hook>,
    options: DatabaseOptions,
    limit: Option<Arc<Semaphore>>,
    idle: Mutex<Vec<IdleConn>>,
    open: AtomicU64,
    in_use: AtomicU64,
    wait_count: AtomicU64,
    max_lifetime_closed: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn idle(&self) -> MutexGuard<'_, Vec<IdleConn>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expired(&self, created: Instant) -> bool {
        self.options
            .max_conn_lifetime()
            .is_some_and(|lifetime| created.elapsed() >= lifetime)
    }

    /// Close `conn` in the background and forget it.
    fn retire(&self, conn: Box<dyn Conn>) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.close().await {
                        debug!(error = %e, "Error closing retired connection");
                    }
                });
            }
            Err(_) => drop(conn),
        }
    }
}

/// A connection checked out of the pool. Returned to the idle list on drop
/// unless it was marked for discard, has expired, or the pool is closed.
pub(crate) struct PooledConn {
    conn: Option<Box<dyn Conn>>,
    created: Instant,
    discard: bool,
    shared: Arc<Shared>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledConn {
    pub(crate) fn conn(&self) -> &dyn Conn {
        match &self.conn {
            Some(conn) => &**conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }

    /// Close the connection instead of returning it to the pool.
    pub(crate) fn discard(&mut self) {
        self.discard = true;
    }

    /// Discard the connection if `result` says it is no longer usable.
    pub(crate) fn note<T>(&mut self, result: &DbResult<T>) {
        if let Err(err) = result {
            self.note_err(err);
        }
    }

    pub(crate) fn note_err(&mut self, err: &DbError) {
        if matches!(err, DbError::Connection { .. } | DbError::Context(_)) {
            self.discard = true;
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.shared.in_use.fetch_sub(1, Ordering::SeqCst);
        let Some(conn) = self.conn.take() else {
            return;
        };
        let expired = self.shared.expired(self.created);
        if expired && !self.discard {
            self.shared.max_lifetime_closed.fetch_add(1, Ordering::SeqCst);
        }
        if self.discard || expired || self.shared.closed.load(Ordering::SeqCst) {
            self.shared.retire(conn);
        } else {
            self.shared.idle().push(IdleConn {
                conn,
                created: self.created,
            });
        }
    }
}

/// Instrumented database handle. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Shared>,
}

impl Database {
    /// Wrap `connector` with `hook` and build a pool over it. No connection
    /// is opened until the first call.
    pub fn open(
        connector: Arc<dyn Connector>,
        hook: Arc<dyn Hook>,
        options: DatabaseOptions,
    ) -> DbResult<Self> {
        options.validate().map_err(DbError::invalid_input)?;
        if options.search_path.is_some() && connector.driver_name() != "postgres" {
            return Err(DbError::invalid_input(format!(
                "search_path is only supported for postgres, not {}",
                connector.driver_name()
            )));
        }

        info!(
            driver = %connector.driver_name(),
            max_open_conns = options.max_open_conns.unwrap_or(0),
            max_conn_lifetime_secs = ?options.max_conn_lifetime_secs,
            search_path = ?options.search_path,
            "Opening database"
        );

        let limit = options
            .max_open_conns
            .map(|n| Arc::new(Semaphore::new(n as usize)));
        Ok(Self {
            inner: Arc::new(Shared {
                connector: wrap_connector(connector, hook.clone()),
                hook,
                options,
                limit,
                idle: Mutex::new(Vec::new()),
                open: AtomicU64::new(0),
                in_use: AtomicU64::new(0),
                wait_count: AtomicU64::new(0),
                max_lifetime_closed: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Open a sqlx-backed database from a parsed connection config.
    pub fn connect(config: &DatabaseConfig, hook: Arc<dyn Hook>) -> DbResult<Self> {
        let connector = SqlxConnector::new(config.connection_string.clone())?;
        Self::open(Arc::new(connector), hook, config.options.clone())
    }

    pub fn driver_name(&self) -> &str {
        self.inner.connector.driver_name()
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.inner.options
    }

    pub(crate) fn hook(&self) -> &dyn Hook {
        &*self.inner.hook
    }

    pub(crate) fn same(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_open: self.inner.options.max_open_conns.unwrap_or(0),
            open: self.inner.open.load(Ordering::SeqCst),
            in_use: self.inner.in_use.load(Ordering::SeqCst),
            idle: self.inner.idle().len() as u64,
            wait_count: self.inner.wait_count.load(Ordering::SeqCst),
            max_lifetime_closed: self.inner.max_lifetime_closed.load(Ordering::SeqCst),
        }
    }

    /// Log pool stats every `collect_metrics_interval` until `ctx` is done.
    /// Returns `None` when no interval is configured.
    pub fn spawn_metrics_task(&self, ctx: Context) -> Option<JoinHandle<()>> {
        let period = self.inner.options.collect_metrics_interval()?;
        Some(self.spawn_metrics_task_every(ctx, period))
    }

    pub fn spawn_metrics_task_every(&self, ctx: Context, period: Duration) -> JoinHandle<()> {
        let db = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ctx.done() => break,
                    _ = interval.tick() => {
                        let stats = db.stats();
                        info!(
                            driver = %db.driver_name(),
                            open = stats.open,
                            in_use = stats.in_use,
                            idle = stats.idle,
                            wait_count = stats.wait_count,
                            max_lifetime_closed = stats.max_lifetime_closed,
                            "Database pool stats"
                        );
                    }
                }
            }
            debug!("Database metrics task stopped");
        })
    }

    /// Check out a connection, reusing an idle one when possible.
    pub(crate) async fn acquire(&self, ctx: &Context) -> DbResult<PooledConn> {
        let shared = &self.inner;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(pool_closed());
        }
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let permit = match &shared.limit {
            None => None,
            Some(sem) => Some(match sem.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    shared.wait_count.fetch_add(1, Ordering::SeqCst);
                    ctx.run(sem.clone().acquire_owned())
                        .await?
                        .map_err(|_| pool_closed())?
                }
            }),
        };

        loop {
            let candidate = shared.idle().pop();
            let Some(idle) = candidate else { break };
            if shared.expired(idle.created) {
                shared.max_lifetime_closed.fetch_add(1, Ordering::SeqCst);
                shared.retire(idle.conn);
                continue;
            }
            match reuse(ctx, &*idle.conn).await {
                Ok(true) => return Ok(self.checked_out(idle.conn, idle.created, permit)),
                Ok(false) => shared.retire(idle.conn),
                Err(e) => {
                    shared.retire(idle.conn);
                    return Err(e);
                }
            }
        }

        let conn = shared.connector.connect(ctx).await?;
        shared.open.fetch_add(1, Ordering::SeqCst);
        if let Some(path) = &shared.options.search_path {
            let sql = format!("SET search_path TO {}", path);
            if let Err(e) = exec::exec(ctx, &*conn, &sql, &[]).await {
                warn!(error = %e, search_path = %path, "Failed to apply search path");
                shared.retire(conn);
                return Err(e);
            }
        }
        Ok(self.checked_out(conn, Instant::now(), permit))
    }

    fn checked_out(
        &self,
        conn: Box<dyn Conn>,
        created: Instant,
        permit: Option<OwnedSemaphorePermit>,
    ) -> PooledConn {
        self.inner.in_use.fetch_add(1, Ordering::SeqCst);
        PooledConn {
            conn: Some(conn),
            created,
            discard: false,
            shared: self.inner.clone(),
            _permit: permit,
        }
    }

    pub async fn ping(&self, ctx: &Context) -> DbResult<()> {
        let mut conn = self.acquire(ctx).await?;
        let result = exec::ping(ctx, conn.conn()).await;
        conn.note(&result);
        result
    }

    /// Close every idle connection and refuse further checkouts. Connections
    /// in use are closed when they are released.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(sem) = &self.inner.limit {
            sem.close();
        }
        let idle: Vec<IdleConn> = std::mem::take(&mut *self.inner.idle());
        for conn in idle {
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = conn.conn.close().await {
                debug!(error = %e, "Error closing idle connection");
            }
        }
        info!(driver = %self.driver_name(), "Database closed");
    }

    /// The active transaction in `ctx` when it belongs to this database.
    fn active_tx(&self, ctx: &Context) -> Option<Transaction> {
        Transaction::from_context(ctx).filter(|tx| tx.database().same(self))
    }
}

/// Prepare a reused connection for its next caller. `Ok(false)` means the
/// connection must be discarded.
async fn reuse(ctx: &Context, conn: &dyn Conn) -> DbResult<bool> {
    let caps = conn.capabilities();
    if caps.contains(ConnCaps::RESET_SESSION) {
        match conn.reset_session(ctx).await {
            Ok(()) => {}
            Err(e) if e.is_unsupported() => {}
            Err(e) if e.is_context() => return Err(e),
            Err(e) => {
                debug!(error = %e, "Session reset failed, discarding connection");
                return Ok(false);
            }
        }
    }
    if caps.contains(ConnCaps::VALIDATOR) && matches!(conn.is_valid(), Ok(false)) {
        debug!("Connection failed validation, discarding");
        return Ok(false);
    }
    Ok(true)
}

fn pool_closed() -> DbError {
    DbError::connection("Database is closed", "Open the database again")
}

#[async_trait]
impl Queryer for Database {
    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<ExecResult> {
        if let Some(tx) = self.active_tx(ctx) {
            return tx.exec(ctx, query, args).await;
        }
        let mut conn = self.acquire(ctx).await?;
        let result = exec::exec(ctx, conn.conn(), query, args).await;
        conn.note(&result);
        result
    }

    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<Rows> {
        if let Some(tx) = self.active_tx(ctx) {
            return tx.query(ctx, query, args).await;
        }
        let mut conn = self.acquire(ctx).await?;
        let result = exec::query(ctx, conn.conn(), query, args).await;
        conn.note(&result);
        result
    }

    async fn prepare(&self, ctx: &Context, query: &str) -> DbResult<Prepared> {
        if let Some(tx) = self.active_tx(ctx) {
            return tx.prepare(ctx, query).await;
        }
        let mut conn = self.acquire(ctx).await?;
        let result = exec::prepare(ctx, conn.conn(), query).await;
        conn.note(&result);
        Ok(Prepared::new(result?, query, StmtOwner::Pool(conn)))
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("driver", &self.driver_name())
            .field("stats", &self.stats())
            .finish()
    }
}
