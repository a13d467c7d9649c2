//! In-memory driver and recording hook shared by the integration tests.
//!
//! `FakeConn` reports a configurable capability subset and panics if any
//! optional method outside that subset is ever called, so a test fails as
//! soon as a wrapper reaches for a delegate that does not exist.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlhook::context::{CancelHandle, Context};
use sqlhook::driver::{Conn, ConnCaps, Connector, Stmt, StmtCaps, Tx, TxOptions};
use sqlhook::error::{DbError, DbResult};
use sqlhook::hook::{Action, Hook};
use sqlhook::models::{ExecResult, NamedValue, Rows, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// How the next commit or rollback behaves.
#[derive(Default)]
pub struct Finish {
    /// Cancelled before the driver answers
    pub cancel: Option<CancelHandle>,
    /// Returned instead of success
    pub error: Option<fn() -> DbError>,
}

/// State shared by every object a [`FakeConnector`] hands out.
#[derive(Default)]
pub struct FakeState {
    log: Mutex<Vec<String>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub commit: Mutex<Finish>,
    pub rollback: Mutex<Finish>,
    pub begin_error: Mutex<Option<fn() -> DbError>>,
    /// Answer of `is_valid`
    pub valid: Mutex<bool>,
}

impl FakeState {
    pub fn new() -> Arc<Self> {
        let state = Self::default();
        *state.valid.lock().unwrap() = true;
        Arc::new(state)
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }
}

pub struct FakeConnector {
    pub name: &'static str,
    pub caps: ConnCaps,
    pub stmt_caps: StmtCaps,
    pub state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new(caps: ConnCaps, stmt_caps: StmtCaps) -> Self {
        Self {
            name: "fake",
            caps,
            stmt_caps,
            state: FakeState::new(),
        }
    }

    pub fn full() -> Self {
        Self::new(ConnCaps::all(), StmtCaps::all())
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn driver_name(&self) -> &str {
        self.name
    }

    async fn connect(&self, _ctx: &Context) -> DbResult<Box<dyn Conn>> {
        let n = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.record(format!("c{n}:connect"));
        Ok(Box::new(FakeConn {
            n,
            caps: self.caps,
            stmt_caps: self.stmt_caps,
            state: self.state.clone(),
        }))
    }
}

pub struct FakeConn {
    pub n: usize,
    pub caps: ConnCaps,
    pub stmt_caps: StmtCaps,
    pub state: Arc<FakeState>,
}

impl FakeConn {
    pub fn new(caps: ConnCaps, stmt_caps: StmtCaps) -> Self {
        Self {
            n: 0,
            caps,
            stmt_caps,
            state: FakeState::new(),
        }
    }

    fn called(&self, cap: ConnCaps, what: &str) {
        assert!(
            self.caps.contains(cap),
            "{what} called on a connection without {cap:?}"
        );
        self.state.record(format!("c{}:{what}", self.n));
    }

    fn answer(&self, query: &str) -> DbResult<()> {
        if query.contains("FAIL") {
            return Err(DbError::connection("injected failure", "none"));
        }
        Ok(())
    }

    fn stmt(&self, query: &str) -> Box<dyn Stmt> {
        Box::new(FakeStmt {
            n: self.n,
            caps: self.stmt_caps,
            query: query.to_string(),
            state: self.state.clone(),
        })
    }

    fn tx(&self) -> DbResult<Box<dyn Tx>> {
        if let Some(err) = *self.state.begin_error.lock().unwrap() {
            return Err(err());
        }
        Ok(Box::new(FakeTx {
            n: self.n,
            state: self.state.clone(),
        }))
    }
}

pub fn rows_for(query: &str, args: &[Value]) -> Rows {
    let mut row = vec![Value::from(query)];
    row.extend(args.iter().cloned());
    let columns = (0..row.len()).map(|i| format!("c{i}")).collect();
    Rows::new(columns, vec![row])
}

#[async_trait]
impl Conn for FakeConn {
    fn capabilities(&self) -> ConnCaps {
        self.caps
    }

    async fn prepare(&self, query: &str) -> DbResult<Box<dyn Stmt>> {
        self.state.record(format!("c{}:prepare:{query}", self.n));
        self.answer(query)?;
        Ok(self.stmt(query))
    }

    async fn begin(&self) -> DbResult<Box<dyn Tx>> {
        self.state.record(format!("c{}:begin", self.n));
        self.tx()
    }

    async fn close(&self) -> DbResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.record(format!("c{}:close", self.n));
        Ok(())
    }

    async fn ping(&self, _ctx: &Context) -> DbResult<()> {
        self.called(ConnCaps::PING, "ping");
        Ok(())
    }

    async fn exec(&self, query: &str, _args: &[Value]) -> DbResult<ExecResult> {
        self.called(ConnCaps::EXEC, &format!("exec:{query}"));
        self.answer(query)?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn exec_context(
        &self,
        ctx: &Context,
        query: &str,
        _args: &[Value],
    ) -> DbResult<ExecResult> {
        self.called(ConnCaps::EXEC_CONTEXT, &format!("exec_context:{query}"));
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        if query.contains("HANG") {
            std::future::pending::<()>().await;
        }
        self.answer(query)?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn query(&self, query: &str, args: &[Value]) -> DbResult<Rows> {
        self.called(ConnCaps::QUERY, &format!("query:{query}"));
        self.answer(query)?;
        Ok(rows_for(query, args))
    }

    async fn query_context(&self, ctx: &Context, query: &str, args: &[Value]) -> DbResult<Rows> {
        self.called(ConnCaps::QUERY_CONTEXT, &format!("query_context:{query}"));
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        self.answer(query)?;
        Ok(rows_for(query, args))
    }

    async fn prepare_context(&self, _ctx: &Context, query: &str) -> DbResult<Box<dyn Stmt>> {
        self.called(ConnCaps::PREPARE_CONTEXT, &format!("prepare_context:{query}"));
        self.answer(query)?;
        Ok(self.stmt(query))
    }

    async fn begin_tx(&self, _ctx: &Context, _opts: TxOptions) -> DbResult<Box<dyn Tx>> {
        self.called(ConnCaps::BEGIN_TX, "begin_tx");
        self.tx()
    }

    async fn reset_session(&self, _ctx: &Context) -> DbResult<()> {
        self.called(ConnCaps::RESET_SESSION, "reset_session");
        Ok(())
    }

    fn is_valid(&self) -> DbResult<bool> {
        self.called(ConnCaps::VALIDATOR, "is_valid");
        Ok(*self.state.valid.lock().unwrap())
    }

    fn check_named_value(&self, value: &mut NamedValue) -> DbResult<()> {
        self.called(ConnCaps::NAMED_VALUE_CHECKER, "check_named_value");
        if let Value::Bool(b) = value.value {
            value.value = Value::Int(b as i64);
        }
        Ok(())
    }
}

pub struct FakeStmt {
    pub n: usize,
    pub caps: StmtCaps,
    pub query: String,
    pub state: Arc<FakeState>,
}

impl FakeStmt {
    pub fn new(caps: StmtCaps) -> Self {
        Self {
            n: 0,
            caps,
            query: "SELECT ?".to_string(),
            state: FakeState::new(),
        }
    }

    fn called(&self, cap: StmtCaps, what: &str) {
        assert!(
            self.caps.contains(cap),
            "{what} called on a statement without {cap:?}"
        );
        self.state.record(format!("c{}:{what}", self.n));
    }
}

#[async_trait]
impl Stmt for FakeStmt {
    fn capabilities(&self) -> StmtCaps {
        self.caps
    }

    fn num_input(&self) -> Option<usize> {
        Some(self.query.matches('?').count())
    }

    async fn exec(&self, _args: &[Value]) -> DbResult<ExecResult> {
        self.state.record(format!("c{}:stmt_exec:{}", self.n, self.query));
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: Some(7),
        })
    }

    async fn query(&self, args: &[Value]) -> DbResult<Rows> {
        self.state.record(format!("c{}:stmt_query:{}", self.n, self.query));
        Ok(rows_for(&self.query, args))
    }

    async fn close(&self) -> DbResult<()> {
        self.state.record(format!("c{}:stmt_close", self.n));
        Ok(())
    }

    async fn exec_context(&self, _ctx: &Context, _args: &[Value]) -> DbResult<ExecResult> {
        self.called(StmtCaps::EXEC_CONTEXT, &format!("stmt_exec_context:{}", self.query));
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: Some(7),
        })
    }

    async fn query_context(&self, _ctx: &Context, args: &[Value]) -> DbResult<Rows> {
        self.called(StmtCaps::QUERY_CONTEXT, &format!("stmt_query_context:{}", self.query));
        Ok(rows_for(&self.query, args))
    }

    fn check_named_value(&self, value: &mut NamedValue) -> DbResult<()> {
        self.called(StmtCaps::NAMED_VALUE_CHECKER, "stmt_check_named_value");
        if let Value::Text(s) = &value.value {
            value.value = Value::Text(s.to_uppercase());
        }
        Ok(())
    }

    fn convert_column(&self, _idx: usize, value: Value) -> DbResult<Value> {
        self.called(StmtCaps::COLUMN_CONVERTER, "convert_column");
        Ok(match value {
            Value::Int(n) => Value::Int(n * 10),
            other => other,
        })
    }
}

pub struct FakeTx {
    n: usize,
    state: Arc<FakeState>,
}

impl FakeTx {
    fn finish(&self, what: &str, finish: &Mutex<Finish>) -> DbResult<()> {
        self.state.record(format!("c{}:{what}", self.n));
        let finish = std::mem::take(&mut *finish.lock().unwrap());
        if let Some(cancel) = finish.cancel {
            cancel.cancel();
        }
        match finish.error {
            Some(err) => Err(err()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Tx for FakeTx {
    async fn commit(&self) -> DbResult<()> {
        self.finish("commit", &self.state.commit)
    }

    async fn rollback(&self) -> DbResult<()> {
        self.finish("rollback", &self.state.rollback)
    }
}

/// One observed hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub hook: &'static str,
    pub phase: &'static str,
    pub action: Option<Action>,
    pub statement: Option<String>,
    pub operation: Option<String>,
    pub conn_id: Option<String>,
    pub args: Vec<Value>,
    pub error: Option<String>,
}

/// Hook that appends every invocation to a shared event list.
pub struct Recorder {
    pub name: &'static str,
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn new(name: &'static str, events: Arc<Mutex<Vec<Event>>>) -> Self {
        Self { name, events }
    }

    fn push(&self, ctx: &Context, phase: &'static str, err: Option<&DbError>) {
        let call = ctx.call();
        self.events.lock().unwrap().push(Event {
            hook: self.name,
            phase,
            action: call.get_action(),
            statement: call.get_statement().map(String::from),
            operation: call.get_operation().map(String::from),
            conn_id: ctx.conn_id().map(|c| c.to_string()),
            args: call.get_args().to_vec(),
            error: err.map(|e| e.to_string()),
        });
    }
}

impl Hook for Recorder {
    fn before(&self, ctx: Context) -> Context {
        self.push(&ctx, "before", None);
        ctx
    }

    fn after(&self, ctx: &Context, err: Option<&DbError>) {
        self.push(ctx, "after", err);
    }
}

pub fn events() -> Arc<Mutex<Vec<Event>>> {
    Arc::new(Mutex::new(Vec::new()))
}

/// `"<hook>.<phase>:<action>"` for each event, for order assertions.
pub fn trace(events: &Arc<Mutex<Vec<Event>>>) -> Vec<String> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|e| {
            format!(
                "{}.{}:{}",
                e.hook,
                e.phase,
                e.action.map(|a| a.as_str()).unwrap_or("-")
            )
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("boom")]
pub struct Boom;
