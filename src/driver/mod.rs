//! Driver contract and capability-preserving wrappers.
//!
//! A driver is described by three object-safe traits: [`Connector`] opens
//! physical connections, [`Conn`] is one connection, [`Stmt`] a prepared
//! statement and [`Tx`] an open transaction. Each trait has a small set of
//! mandatory methods and a number of optional capabilities. An
//! implementation advertises which optional capabilities it has through
//! `capabilities()`; the default body of every optional method returns
//! [`DbError::Unsupported`], which upstream code treats as "use the fallback
//! path".
//!
//! [`wrap::wrap_connector`] instruments a connector so every connection,
//! statement and transaction it produces reports to a [`Hook`](crate::hook::Hook)
//! while exposing exactly the capability set of the wrapped object.

pub mod backend;
pub mod wrap;

pub use backend::{DatabaseType, SqlxConnector};
pub use wrap::{
    WrappedConn, WrappedConnector, WrappedStmt, WrappedTx, unwrap_conn, unwrap_stmt, wrap_connector,
};

use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, NamedValue, Rows, Value};
use async_trait::async_trait;
use std::fmt;

bitflags::bitflags! {
    /// Optional capabilities of a [`Conn`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnCaps: u16 {
        const PING = 1;
        const EXEC = 1 << 1;
        const EXEC_CONTEXT = 1 << 2;
        const QUERY = 1 << 3;
        const QUERY_CONTEXT = 1 << 4;
        const PREPARE_CONTEXT = 1 << 5;
        const BEGIN_TX = 1 << 6;
        const RESET_SESSION = 1 << 7;
        const VALIDATOR = 1 << 8;
        const NAMED_VALUE_CHECKER = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Optional capabilities of a [`Stmt`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StmtCaps: u8 {
        const EXEC_CONTEXT = 1;
        const QUERY_CONTEXT = 1 << 1;
        const NAMED_VALUE_CHECKER = 1 << 2;
        const COLUMN_CONVERTER = 1 << 3;
    }
}

/// Transaction isolation level requested at begin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Whatever the server is configured with.
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::Serializable => Some("SERIALIZABLE"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    fn driver_name(&self) -> &str;

    async fn connect(&self, ctx: &Context) -> DbResult<Box<dyn Conn>>;
}

/// One physical connection. Callers serialize use of a connection.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Optional capabilities implemented by this connection.
    fn capabilities(&self) -> ConnCaps;

    async fn prepare(&self, query: &str) -> DbResult<Box<dyn Stmt>>;

    async fn begin(&self) -> DbResult<Box<dyn Tx>>;

    async fn close(&self) -> DbResult<()>;

    async fn ping(&self, _ctx: &Context) -> DbResult<()> {
        Err(DbError::unsupported("ping"))
    }

    async fn exec(&self, _query: &str, _args: &[Value]) -> DbResult<ExecResult> {
        Err(DbError::unsupported("exec"))
    }

    async fn exec_context(
        &self,
        _ctx: &Context,
        _query: &str,
        _args: &[Value],
    ) -> DbResult<ExecResult> {
        Err(DbError::unsupported("exec_context"))
    }

    async fn query(&self, _query: &str, _args: &[Value]) -> DbResult<Rows> {
        Err(DbError::unsupported("query"))
    }

    async fn query_context(&self, _ctx: &Context, _query: &str, _args: &[Value]) -> DbResult<Rows> {
        Err(DbError::unsupported("query_context"))
    }

    async fn prepare_context(&self, _ctx: &Context, _query: &str) -> DbResult<Box<dyn Stmt>> {
        Err(DbError::unsupported("prepare_context"))
    }

    async fn begin_tx(&self, _ctx: &Context, _opts: TxOptions) -> DbResult<Box<dyn Tx>> {
        Err(DbError::unsupported("begin_tx"))
    }

    async fn reset_session(&self, _ctx: &Context) -> DbResult<()> {
        Err(DbError::unsupported("reset_session"))
    }

    fn is_valid(&self) -> DbResult<bool> {
        Err(DbError::unsupported("is_valid"))
    }

    fn check_named_value(&self, _value: &mut NamedValue) -> DbResult<()> {
        Err(DbError::unsupported("check_named_value"))
    }

    /// The wrapped connection, if this is a wrapper.
    fn inner(&self) -> Option<&dyn Conn> {
        None
    }
}

/// A prepared statement bound to the connection that prepared it.
#[async_trait]
pub trait Stmt: Send + Sync {
    fn capabilities(&self) -> StmtCaps;

    /// Number of placeholders, if the driver knows it.
    fn num_input(&self) -> Option<usize>;

    async fn exec(&self, args: &[Value]) -> DbResult<ExecResult>;

    async fn query(&self, args: &[Value]) -> DbResult<Rows>;

    async fn close(&self) -> DbResult<()>;

    async fn exec_context(&self, _ctx: &Context, _args: &[Value]) -> DbResult<ExecResult> {
        Err(DbError::unsupported("stmt_exec_context"))
    }

    async fn query_context(&self, _ctx: &Context, _args: &[Value]) -> DbResult<Rows> {
        Err(DbError::unsupported("stmt_query_context"))
    }

    fn check_named_value(&self, _value: &mut NamedValue) -> DbResult<()> {
        Err(DbError::unsupported("stmt_check_named_value"))
    }

    /// Convert a value read from column `idx`.
    fn convert_column(&self, _idx: usize, _value: Value) -> DbResult<Value> {
        Err(DbError::unsupported("convert_column"))
    }

    fn inner(&self) -> Option<&dyn Stmt> {
        None
    }
}

/// An open transaction on one connection.
#[async_trait]
pub trait Tx: Send + Sync {
    async fn commit(&self) -> DbResult<()>;

    async fn rollback(&self) -> DbResult<()>;
}

impl fmt::Debug for dyn Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("capabilities", &self.capabilities())
            .field("wrapped", &self.inner().is_some())
            .finish()
    }
}

impl fmt::Debug for dyn Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stmt")
            .field("capabilities", &self.capabilities())
            .field("num_input", &self.num_input())
            .finish()
    }
}
