//! Capability negotiation on a single connection.
//!
//! Each helper prefers the context-aware capability, falls back to the plain
//! one, and finally to preparing a statement. A capability that reports
//! [`DbError::Unsupported`] at call time is treated like an absent one, so a
//! driver can decline a specific call and still get the fallback path.

use crate::context::Context;
use crate::driver::wrap::with_caller;
use crate::driver::{Conn, ConnCaps, Stmt, StmtCaps, Tx, TxOptions};
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, NamedValue, Rows, Value};
use std::borrow::Cow;

/// `Ok(None)` when the capability declined the call.
fn declined<T>(result: DbResult<T>) -> DbResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_unsupported() => Ok(None),
        Err(e) => Err(e),
    }
}

fn live(ctx: &Context) -> DbResult<()> {
    match ctx.err() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Run the arguments through the statement's named value checker, or the
/// connection's when the statement has none.
pub(crate) fn check_args<'a>(
    conn: &dyn Conn,
    stmt: Option<&dyn Stmt>,
    args: &'a [Value],
) -> DbResult<Cow<'a, [Value]>> {
    let stmt_checks = stmt.is_some_and(|s| s.capabilities().contains(StmtCaps::NAMED_VALUE_CHECKER));
    let conn_checks = conn.capabilities().contains(ConnCaps::NAMED_VALUE_CHECKER);
    if args.is_empty() || !(stmt_checks || conn_checks) {
        return Ok(Cow::Borrowed(args));
    }

    let mut named = NamedValue::positional(args);
    for value in &mut named {
        let checked = match stmt {
            Some(s) if stmt_checks => declined(s.check_named_value(value))?,
            _ => None,
        };
        if checked.is_none() && conn_checks {
            declined(conn.check_named_value(value))?;
        }
    }
    Ok(Cow::Owned(named.into_iter().map(|n| n.value).collect()))
}

pub(crate) async fn exec(
    ctx: &Context,
    conn: &dyn Conn,
    query: &str,
    args: &[Value],
) -> DbResult<ExecResult> {
    live(ctx)?;
    let caps = conn.capabilities();
    let checked = check_args(conn, None, args)?;

    if caps.contains(ConnCaps::EXEC_CONTEXT) {
        if let Some(res) = declined(conn.exec_context(ctx, query, &checked).await)? {
            return Ok(res);
        }
    }
    if caps.contains(ConnCaps::EXEC) {
        if let Some(res) = declined(with_caller(ctx, conn.exec(query, &checked)).await)? {
            return Ok(res);
        }
    }

    let stmt = prepare(ctx, conn, query).await?;
    let result = stmt_exec(ctx, conn, &*stmt, args).await;
    let _ = stmt.close().await;
    result
}

pub(crate) async fn query(
    ctx: &Context,
    conn: &dyn Conn,
    query: &str,
    args: &[Value],
) -> DbResult<Rows> {
    live(ctx)?;
    let caps = conn.capabilities();
    let checked = check_args(conn, None, args)?;

    if caps.contains(ConnCaps::QUERY_CONTEXT) {
        if let Some(rows) = declined(conn.query_context(ctx, query, &checked).await)? {
            return Ok(rows);
        }
    }
    if caps.contains(ConnCaps::QUERY) {
        if let Some(rows) = declined(with_caller(ctx, conn.query(query, &checked)).await)? {
            return Ok(rows);
        }
    }

    let stmt = prepare(ctx, conn, query).await?;
    let result = stmt_query(ctx, conn, &*stmt, args).await;
    let _ = stmt.close().await;
    result
}

pub(crate) async fn prepare(ctx: &Context, conn: &dyn Conn, query: &str) -> DbResult<Box<dyn Stmt>> {
    live(ctx)?;
    if conn.capabilities().contains(ConnCaps::PREPARE_CONTEXT) {
        if let Some(stmt) = declined(conn.prepare_context(ctx, query).await)? {
            return Ok(stmt);
        }
    }
    with_caller(ctx, conn.prepare(query)).await
}

pub(crate) async fn stmt_exec(
    ctx: &Context,
    conn: &dyn Conn,
    stmt: &dyn Stmt,
    args: &[Value],
) -> DbResult<ExecResult> {
    live(ctx)?;
    check_arity(stmt, args)?;
    let checked = check_args(conn, Some(stmt), args)?;
    if stmt.capabilities().contains(StmtCaps::EXEC_CONTEXT) {
        if let Some(res) = declined(stmt.exec_context(ctx, &checked).await)? {
            return Ok(res);
        }
    }
    with_caller(ctx, stmt.exec(&checked)).await
}

pub(crate) async fn stmt_query(
    ctx: &Context,
    conn: &dyn Conn,
    stmt: &dyn Stmt,
    args: &[Value],
) -> DbResult<Rows> {
    live(ctx)?;
    check_arity(stmt, args)?;
    let checked = check_args(conn, Some(stmt), args)?;
    let mut rows = None;
    if stmt.capabilities().contains(StmtCaps::QUERY_CONTEXT) {
        rows = declined(stmt.query_context(ctx, &checked).await)?;
    }
    let mut rows = match rows {
        Some(rows) => rows,
        None => with_caller(ctx, stmt.query(&checked)).await?,
    };

    if stmt.capabilities().contains(StmtCaps::COLUMN_CONVERTER) {
        for idx in 0..rows.columns().len() {
            rows.map_column(idx, |v| match stmt.convert_column(idx, v.clone()) {
                Err(e) if e.is_unsupported() => Ok(v),
                other => other,
            })?;
        }
    }
    Ok(rows)
}

fn check_arity(stmt: &dyn Stmt, args: &[Value]) -> DbResult<()> {
    match stmt.num_input() {
        Some(n) if n != args.len() => Err(DbError::invalid_input(format!(
            "expected {} arguments, got {}",
            n,
            args.len()
        ))),
        _ => Ok(()),
    }
}

/// Begin a transaction. Non-default options need `BEGIN_TX`.
pub(crate) async fn begin(ctx: &Context, conn: &dyn Conn, opts: TxOptions) -> DbResult<Box<dyn Tx>> {
    live(ctx)?;
    if conn.capabilities().contains(ConnCaps::BEGIN_TX) {
        if let Some(tx) = declined(conn.begin_tx(ctx, opts).await)? {
            return Ok(tx);
        }
    }
    if !opts.is_default() {
        return Err(DbError::invalid_input(
            "driver does not support non-default transaction options",
        ));
    }
    with_caller(ctx, conn.begin()).await
}

/// Ping, treating a driver without `PING` as healthy.
pub(crate) async fn ping(ctx: &Context, conn: &dyn Conn) -> DbResult<()> {
    live(ctx)?;
    if conn.capabilities().contains(ConnCaps::PING) {
        declined(conn.ping(ctx).await)?;
    }
    Ok(())
}
