//! sqlhook
//!
//! Instrumented database access: driver wrappers that report every call to
//! pluggable hooks without changing what the driver can do, a connection
//! pool over them, a transaction manager with exactly-once commit or
//! rollback and a statement-level retry wrapper.

pub mod config;
pub mod context;
pub mod db;
pub mod driver;
pub mod error;
pub mod hook;
pub mod models;

pub use config::{Config, DatabaseConfig, DatabaseOptions};
pub use context::{CancelHandle, Context, ContextError};
pub use db::{Database, Queryer, RetryPolicy, Retrying, Transaction, register_after_commit_callback};
pub use error::{DbError, DbResult};
pub use hook::{Hook, Hooks, NoopHook, TracingHook};
pub use models::{ExecResult, Row, Rows, Value};
