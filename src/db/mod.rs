//! Database handle, transaction manager and retry wrapper.
//!
//! - [`Database`]: pool of instrumented connections
//! - [`Transaction`] / [`Database::with_tx`]: exactly-once commit or rollback
//! - [`Retrying`]: statement-level retry outside transactions
//!
//! All three implement [`Queryer`], so code can be written once against the
//! trait and run on any of them.

pub(crate) mod exec;
pub mod pool;
pub mod retry;
pub mod transaction;

pub use pool::{Database, PoolStats};
pub use retry::{Backoff, RetryPolicy, Retrying};
pub use transaction::{Transaction, register_after_commit_callback};

use crate::context::Context;
use crate::driver::Stmt;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, Row, Rows, Value};
use async_trait::async_trait;
use pool::PooledConn;

/// Statement execution surface shared by databases, transactions and
/// retrying wrappers.
#[async_trait]
pub trait Queryer: Send + Sync {
    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<ExecResult>;

    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<Rows>;

    /// First row of `query`, or [`DbError::RowNotFound`].
    async fn get(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<Row> {
        self.query(ctx, query, args)
            .await?
            .get(0)
            .ok_or(DbError::RowNotFound)
    }

    async fn prepare(&self, ctx: &Context, query: &str) -> DbResult<Prepared>;
}

/// What keeps a prepared statement's connection alive.
pub(crate) enum StmtOwner {
    Pool(PooledConn),
    Tx(Transaction),
}

/// A statement prepared on a pooled connection or inside a transaction.
pub struct Prepared {
    stmt: Box<dyn Stmt>,
    query: String,
    owner: StmtOwner,
}

impl Prepared {
    pub(crate) fn new(stmt: Box<dyn Stmt>, query: &str, owner: StmtOwner) -> Self {
        Self {
            stmt,
            query: query.to_string(),
            owner,
        }
    }

    pub fn query_text(&self) -> &str {
        &self.query
    }

    pub fn num_input(&self) -> Option<usize> {
        self.stmt.num_input()
    }

    pub async fn exec(&self, ctx: &Context, args: &[Value]) -> DbResult<ExecResult> {
        match &self.owner {
            StmtOwner::Pool(conn) => exec::stmt_exec(ctx, conn.conn(), &*self.stmt, args).await,
            StmtOwner::Tx(tx) => {
                let conn = tx.conn(ctx).await?;
                exec::stmt_exec(ctx, conn.get(), &*self.stmt, args).await
            }
        }
    }

    pub async fn query(&self, ctx: &Context, args: &[Value]) -> DbResult<Rows> {
        match &self.owner {
            StmtOwner::Pool(conn) => exec::stmt_query(ctx, conn.conn(), &*self.stmt, args).await,
            StmtOwner::Tx(tx) => {
                let conn = tx.conn(ctx).await?;
                exec::stmt_query(ctx, conn.get(), &*self.stmt, args).await
            }
        }
    }

    pub async fn get(&self, ctx: &Context, args: &[Value]) -> DbResult<Row> {
        self.query(ctx, args)
            .await?
            .get(0)
            .ok_or(DbError::RowNotFound)
    }

    /// Close the statement. Its pooled connection, if any, goes back to the
    /// pool.
    pub async fn close(self) -> DbResult<()> {
        self.stmt.close().await
    }
}

impl std::fmt::Debug for Prepared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prepared")
            .field("query", &self.query)
            .field("in_tx", &matches!(self.owner, StmtOwner::Tx(_)))
            .finish()
    }
}
