//! Capability-preserving instrumentation wrappers.
//!
//! The capability set of the wrapped object is read once, at wrap time, and
//! reported unchanged by the wrapper. Calls to a capability the wrapped
//! object lacks fail with [`DbError::Unsupported`] without reaching the hook
//! or the wrapped object, so callers fall back exactly as they would on the
//! raw driver. Every call that does reach the wrapped object is surrounded by
//! one `before` and one `after`, and its result is returned untouched.

use super::{Conn, ConnCaps, Connector, Stmt, StmtCaps, Tx, TxOptions};
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::hook::{Action, CallMeta, ConnId, Hook, TaggedHook, observe};
use crate::models::{ExecResult, NamedValue, Rows, Value};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

tokio::task_local! {
    /// Context of the caller driving a plain driver method, which has no
    /// context parameter of its own.
    static CALLER: Context;
}

/// Run `fut` with `ctx` as the caller context seen by the plain methods of
/// wrapped connections and statements.
pub(crate) async fn with_caller<F: Future>(ctx: &Context, fut: F) -> F::Output {
    CALLER.scope(ctx.clone(), fut).await
}

fn caller() -> Context {
    CALLER.try_with(Context::clone).unwrap_or_default()
}

/// Instrument every connection opened by `connector`.
pub fn wrap_connector(connector: Arc<dyn Connector>, hook: Arc<dyn Hook>) -> WrappedConnector {
    WrappedConnector {
        inner: connector,
        hook,
    }
}

/// Walk a chain of wrappers down to the driver's own connection.
pub fn unwrap_conn(conn: &dyn Conn) -> &dyn Conn {
    let mut current = conn;
    while let Some(inner) = current.inner() {
        current = inner;
    }
    current
}

/// Walk a chain of wrappers down to the driver's own statement.
pub fn unwrap_stmt(stmt: &dyn Stmt) -> &dyn Stmt {
    let mut current = stmt;
    while let Some(inner) = current.inner() {
        current = inner;
    }
    current
}

pub struct WrappedConnector {
    inner: Arc<dyn Connector>,
    hook: Arc<dyn Hook>,
}

#[async_trait]
impl Connector for WrappedConnector {
    fn driver_name(&self) -> &str {
        self.inner.driver_name()
    }

    async fn connect(&self, ctx: &Context) -> DbResult<Box<dyn Conn>> {
        let conn = self.inner.connect(ctx).await?;
        let wrapped = WrappedConn::new(conn, self.hook.clone());
        debug!(
            driver = %self.inner.driver_name(),
            conn_id = %wrapped.id(),
            capabilities = ?wrapped.capabilities(),
            "Opened instrumented connection"
        );
        Ok(Box::new(wrapped))
    }
}

/// Instrumented connection.
pub struct WrappedConn {
    inner: Box<dyn Conn>,
    caps: ConnCaps,
    id: ConnId,
    hook: Arc<dyn Hook>,
}

impl WrappedConn {
    /// Wrap `conn`, assigning it a fresh connection id.
    pub fn new(conn: Box<dyn Conn>, hook: Arc<dyn Hook>) -> Self {
        let id = ConnId::generate();
        Self {
            caps: conn.capabilities(),
            hook: Arc::new(TaggedHook::new(id.clone(), hook)),
            inner: conn,
            id,
        }
    }

    pub fn id(&self) -> &ConnId {
        &self.id
    }

    fn require(&self, cap: ConnCaps, name: &'static str) -> DbResult<()> {
        if self.caps.contains(cap) {
            Ok(())
        } else {
            Err(DbError::unsupported(name))
        }
    }

    fn wrap_stmt(&self, stmt: Box<dyn Stmt>, query: &str) -> Box<dyn Stmt> {
        Box::new(WrappedStmt::new(stmt, query, self.hook.clone()))
    }
}

#[async_trait]
impl Conn for WrappedConn {
    fn capabilities(&self) -> ConnCaps {
        self.caps
    }

    async fn prepare(&self, query: &str) -> DbResult<Box<dyn Stmt>> {
        let meta = CallMeta::new().action(Action::Prepare).statement(query);
        let stmt = observe(&*self.hook, &caller(), meta, |ctx| async move {
            with_caller(&ctx, self.inner.prepare(query)).await
        })
        .await?;
        Ok(self.wrap_stmt(stmt, query))
    }

    async fn begin(&self) -> DbResult<Box<dyn Tx>> {
        let meta = CallMeta::new().action(Action::Begin);
        let ctx = caller();
        let tx = observe(&*self.hook, &ctx, meta, |ctx| async move {
            with_caller(&ctx, self.inner.begin()).await
        })
        .await?;
        Ok(Box::new(WrappedTx::new(tx, ctx, self.hook.clone())))
    }

    async fn close(&self) -> DbResult<()> {
        self.inner.close().await
    }

    async fn ping(&self, ctx: &Context) -> DbResult<()> {
        self.require(ConnCaps::PING, "ping")?;
        self.inner.ping(&ctx.with_conn_id(self.id.clone())).await
    }

    async fn exec(&self, query: &str, args: &[Value]) -> DbResult<ExecResult> {
        self.require(ConnCaps::EXEC, "exec")?;
        let meta = CallMeta::new()
            .action(Action::Exec)
            .statement(query)
            .args(args);
        observe(&*self.hook, &caller(), meta, |ctx| async move {
            with_caller(&ctx, self.inner.exec(query, args)).await
        })
        .await
    }

    async fn exec_context(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> DbResult<ExecResult> {
        self.require(ConnCaps::EXEC_CONTEXT, "exec_context")?;
        let meta = CallMeta::new()
            .action(Action::Exec)
            .statement(query)
            .args(args);
        observe(&*self.hook, ctx, meta, |ctx| async move {
            self.inner.exec_context(&ctx, query, args).await
        })
        .await
    }

    async fn query(&self, query: &str, args: &[Value]) -> DbResult<Rows> {
        self.require(ConnCaps::QUERY, "query")?;
        let meta = CallMeta::new()
            .action(Action::Query)
            .statement(query)
            .args(args);
        observe(&*self.hook, &caller(), meta, |ctx| async move {
            with_caller(&ctx, self.inner.query(query, args)).await
        })
        .await
    }

    async fn query_context(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<Rows> {
        self.require(ConnCaps::QUERY_CONTEXT, "query_context")?;
        let meta = CallMeta::new()
            .action(Action::Query)
            .statement(query)
            .args(args);
        observe(&*self.hook, ctx, meta, |ctx| async move {
            self.inner.query_context(&ctx, query, args).await
        })
        .await
    }

    async fn prepare_context(&self, ctx: &Context, query: &str) -> DbResult<Box<dyn Stmt>> {
        self.require(ConnCaps::PREPARE_CONTEXT, "prepare_context")?;
        let meta = CallMeta::new().action(Action::Prepare).statement(query);
        let stmt = observe(&*self.hook, ctx, meta, |ctx| async move {
            self.inner.prepare_context(&ctx, query).await
        })
        .await?;
        Ok(self.wrap_stmt(stmt, query))
    }

    async fn begin_tx(&self, ctx: &Context, opts: TxOptions) -> DbResult<Box<dyn Tx>> {
        self.require(ConnCaps::BEGIN_TX, "begin_tx")?;
        let meta = CallMeta::new().action(Action::Begin);
        let tx = observe(&*self.hook, ctx, meta, |ctx| async move {
            self.inner.begin_tx(&ctx, opts).await
        })
        .await?;
        Ok(Box::new(WrappedTx::new(tx, ctx.clone(), self.hook.clone())))
    }

    async fn reset_session(&self, ctx: &Context) -> DbResult<()> {
        self.require(ConnCaps::RESET_SESSION, "reset_session")?;
        self.inner
            .reset_session(&ctx.with_conn_id(self.id.clone()))
            .await
    }

    fn is_valid(&self) -> DbResult<bool> {
        self.require(ConnCaps::VALIDATOR, "is_valid")?;
        self.inner.is_valid()
    }

    fn check_named_value(&self, value: &mut NamedValue) -> DbResult<()> {
        self.require(ConnCaps::NAMED_VALUE_CHECKER, "check_named_value")?;
        self.inner.check_named_value(value)
    }

    fn inner(&self) -> Option<&dyn Conn> {
        Some(&*self.inner)
    }
}

impl std::fmt::Debug for WrappedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedConn")
            .field("id", &self.id)
            .field("capabilities", &self.caps)
            .finish()
    }
}

/// Instrumented prepared statement. Remembers its query text so every
/// execution reports it.
pub struct WrappedStmt {
    inner: Box<dyn Stmt>,
    caps: StmtCaps,
    query: String,
    hook: Arc<dyn Hook>,
}

impl WrappedStmt {
    pub fn new(stmt: Box<dyn Stmt>, query: &str, hook: Arc<dyn Hook>) -> Self {
        Self {
            caps: stmt.capabilities(),
            inner: stmt,
            query: query.to_string(),
            hook,
        }
    }

    pub fn query_text(&self) -> &str {
        &self.query
    }

    fn require(&self, cap: StmtCaps, name: &'static str) -> DbResult<()> {
        if self.caps.contains(cap) {
            Ok(())
        } else {
            Err(DbError::unsupported(name))
        }
    }

    fn meta(&self, action: Action, args: &[Value]) -> CallMeta {
        CallMeta::new()
            .action(action)
            .statement(self.query.as_str())
            .args(args)
    }
}

#[async_trait]
impl Stmt for WrappedStmt {
    fn capabilities(&self) -> StmtCaps {
        self.caps
    }

    fn num_input(&self) -> Option<usize> {
        self.inner.num_input()
    }

    async fn exec(&self, args: &[Value]) -> DbResult<ExecResult> {
        let meta = self.meta(Action::Exec, args);
        observe(&*self.hook, &caller(), meta, |ctx| async move {
            with_caller(&ctx, self.inner.exec(args)).await
        })
        .await
    }

    async fn query(&self, args: &[Value]) -> DbResult<Rows> {
        let meta = self.meta(Action::Query, args);
        observe(&*self.hook, &caller(), meta, |ctx| async move {
            with_caller(&ctx, self.inner.query(args)).await
        })
        .await
    }

    async fn close(&self) -> DbResult<()> {
        self.inner.close().await
    }

    async fn exec_context(&self, ctx: &Context, args: &[Value]) -> DbResult<ExecResult> {
        self.require(StmtCaps::EXEC_CONTEXT, "stmt_exec_context")?;
        let meta = self.meta(Action::Exec, args);
        observe(&*self.hook, ctx, meta, |ctx| async move {
            self.inner.exec_context(&ctx, args).await
        })
        .await
    }

    async fn query_context(&self, ctx: &Context, args: &[Value]) -> DbResult<Rows> {
        self.require(StmtCaps::QUERY_CONTEXT, "stmt_query_context")?;
        let meta = self.meta(Action::Query, args);
        observe(&*self.hook, ctx, meta, |ctx| async move {
            self.inner.query_context(&ctx, args).await
        })
        .await
    }

    fn check_named_value(&self, value: &mut NamedValue) -> DbResult<()> {
        self.require(StmtCaps::NAMED_VALUE_CHECKER, "stmt_check_named_value")?;
        self.inner.check_named_value(value)
    }

    fn convert_column(&self, idx: usize, value: Value) -> DbResult<Value> {
        self.require(StmtCaps::COLUMN_CONVERTER, "convert_column")?;
        self.inner.convert_column(idx, value)
    }

    fn inner(&self) -> Option<&dyn Stmt> {
        Some(&*self.inner)
    }
}

/// Instrumented transaction. Commit and rollback are reported against the
/// context the transaction was begun with.
pub struct WrappedTx {
    inner: Box<dyn Tx>,
    ctx: Context,
    hook: Arc<dyn Hook>,
}

impl WrappedTx {
    pub fn new(tx: Box<dyn Tx>, ctx: Context, hook: Arc<dyn Hook>) -> Self {
        Self {
            inner: tx,
            ctx,
            hook,
        }
    }
}

#[async_trait]
impl Tx for WrappedTx {
    async fn commit(&self) -> DbResult<()> {
        let meta = CallMeta::new().action(Action::Commit);
        observe(&*self.hook, &self.ctx, meta, |_ctx| self.inner.commit()).await
    }

    async fn rollback(&self) -> DbResult<()> {
        let meta = CallMeta::new().action(Action::Rollback);
        observe(&*self.hook, &self.ctx, meta, |_ctx| self.inner.rollback()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::NoopHook;

    struct Bare;

    #[async_trait]
    impl Conn for Bare {
        fn capabilities(&self) -> ConnCaps {
            ConnCaps::empty()
        }
        async fn prepare(&self, _query: &str) -> DbResult<Box<dyn Stmt>> {
            Err(DbError::internal("not used"))
        }
        async fn begin(&self) -> DbResult<Box<dyn Tx>> {
            Err(DbError::internal("not used"))
        }
        async fn close(&self) -> DbResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_missing_capability_is_unsupported() {
        let conn = WrappedConn::new(Box::new(Bare), Arc::new(NoopHook));
        let err = conn
            .exec_context(&Context::background(), "SELECT 1", &[])
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
        assert!(conn.ping(&Context::background()).await.unwrap_err().is_unsupported());
        assert!(conn.is_valid().unwrap_err().is_unsupported());
    }

    #[test]
    fn test_unwrap_reaches_driver_conn() {
        let raw: Box<dyn Conn> = Box::new(Bare);
        let raw_ptr = &*raw as *const dyn Conn;
        let once = WrappedConn::new(raw, Arc::new(NoopHook));
        let twice = WrappedConn::new(Box::new(once), Arc::new(NoopHook));
        assert!(std::ptr::addr_eq(unwrap_conn(&twice), raw_ptr));
    }
}
