//! sqlhook - Main entry point.
//!
//! Runs SQL statements through the instrumented connection stack and prints
//! the results as JSON, one line per statement.

use clap::Parser;
use serde_json::json;
use sqlhook::config::{Config, DatabaseConfig};
use sqlhook::context::Context;
use sqlhook::db::{Database, Queryer, Retrying};
use sqlhook::error::DbResult;
use sqlhook::hook::TracingHook;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only results
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Whether `sql` produces a result set.
fn returns_rows(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        keyword.as_str(),
        "SELECT" | "WITH" | "SHOW" | "PRAGMA" | "EXPLAIN" | "VALUES" | "DESCRIBE" | "TABLE"
    ) || sql.to_ascii_uppercase().contains(" RETURNING ")
}

async fn run_statements<Q>(
    q: &Q,
    ctx: &Context,
    statements: &[String],
) -> DbResult<Vec<serde_json::Value>>
where
    Q: Queryer + ?Sized,
{
    let mut out = Vec::with_capacity(statements.len());
    for sql in statements {
        let result = if returns_rows(sql) {
            let rows = q.query(ctx, sql, &[]).await?;
            json!({ "statement": sql, "rows": rows.to_json() })
        } else {
            let res = q.exec(ctx, sql, &[]).await?;
            json!({
                "statement": sql,
                "rows_affected": res.rows_affected,
                "last_insert_id": res.last_insert_id,
            })
        };
        out.push(result);
    }
    Ok(out)
}

async fn run(
    config: &Config,
    db_config: &DatabaseConfig,
    db: &Database,
    ctx: &Context,
) -> Result<(), Box<dyn std::error::Error>> {
    let results = if config.tx {
        if db_config.retry.is_enabled() {
            warn!("Statement retry is disabled inside a transaction");
        }
        db.with_tx(ctx, false, |tx_ctx| async move {
            run_statements(db, &tx_ctx, &config.statements).await
        })
        .await?
    } else {
        match db_config.retry.policy() {
            Some(policy) => {
                let retrying = Retrying::new(db.clone(), policy);
                run_statements(&retrying, ctx, &config.statements).await?
            }
            None => run_statements(db, ctx, &config.statements).await?,
        }
    };

    for result in results {
        println!("{result}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let db_config = config.parse_database()?;
    info!(
        database = ?db_config.database,
        statements = config.statements.len(),
        tx = config.tx,
        "Starting sqlhook v{}",
        env!("CARGO_PKG_VERSION")
    );

    let hook = Arc::new(TracingHook::new().with_args(config.log_args));
    let db = Database::connect(&db_config, hook)?;

    let (root, cancel) = Context::background().with_cancel();
    let metrics = db.spawn_metrics_task(root.clone());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let (ctx, _deadline) = root.with_timeout(config.timeout_duration());
    let ctx = ctx.with_operation(config.operation.clone());
    let result = run(&config, &db_config, &db, &ctx).await;

    cancel.cancel();
    if let Some(handle) = metrics {
        let _ = handle.await;
    }
    db.close().await;

    if let Err(e) = result {
        error!(error = %e, "Run failed");
        return Err(e);
    }

    info!("Done");
    Ok(())
}
