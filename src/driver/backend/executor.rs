//! Statement execution on a single sqlx connection.
//!
//! Each submodule provides the same interface adapted to its database type.
//! The code structure is intentionally parallel to make differences obvious.

use super::types::RowToValues;
use super::{DatabaseType, Physical};
use crate::driver::{IsolationLevel, TxOptions};
use crate::error::{DbError, DbResult};
use crate::impl_db_dispatch;
use crate::models::{ExecResult, Rows, Value};
use futures_util::TryStreamExt;

pub(crate) async fn execute(conn: &mut Physical, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
    impl_db_dispatch!(conn, {
        MySql(c) => mysql::execute(c, sql, args).await,
        Postgres(c) => postgres::execute(c, sql, args).await,
        SQLite(c) => sqlite::execute(c, sql, args).await,
    })
}

pub(crate) async fn fetch(conn: &mut Physical, sql: &str, args: &[Value]) -> DbResult<Rows> {
    impl_db_dispatch!(conn, {
        MySql(c) => mysql::fetch(c, sql, args).await,
        Postgres(c) => postgres::fetch(c, sql, args).await,
        SQLite(c) => sqlite::fetch(c, sql, args).await,
    })
}

/// Prepare `sql` server-side, returning its placeholder count when known.
pub(crate) async fn prepare(conn: &mut Physical, sql: &str) -> DbResult<Option<usize>> {
    use sqlx::{Either, Executor, Statement};

    fn count(params: Option<Either<&[impl Sized], usize>>) -> Option<usize> {
        params.map(|p| match p {
            Either::Left(types) => types.len(),
            Either::Right(n) => n,
        })
    }

    impl_db_dispatch!(conn, {
        MySql(c) => Ok(count(c.prepare(sql).await?.parameters())),
        Postgres(c) => Ok(count(c.prepare(sql).await?.parameters())),
        SQLite(c) => Ok(count(c.prepare(sql).await?.parameters())),
    })
}

/// Statements that open a transaction with `opts`.
pub(crate) fn begin_statements(db: DatabaseType, opts: TxOptions) -> DbResult<Vec<String>> {
    let isolation = opts.isolation.as_sql();
    match db {
        DatabaseType::Postgres => {
            let mut sql = String::from("BEGIN");
            if let Some(level) = isolation {
                sql.push_str(" ISOLATION LEVEL ");
                sql.push_str(level);
            }
            if opts.read_only {
                sql.push_str(" READ ONLY");
            }
            Ok(vec![sql])
        }
        DatabaseType::MySql => {
            let mut stmts = Vec::with_capacity(2);
            if let Some(level) = isolation {
                stmts.push(format!("SET TRANSACTION ISOLATION LEVEL {}", level));
            }
            stmts.push(if opts.read_only {
                "START TRANSACTION READ ONLY".to_string()
            } else {
                "START TRANSACTION".to_string()
            });
            Ok(stmts)
        }
        DatabaseType::SQLite => {
            if opts.read_only {
                return Err(DbError::invalid_input(
                    "SQLite does not support read-only transactions",
                ));
            }
            match opts.isolation {
                IsolationLevel::Default | IsolationLevel::Serializable => {
                    Ok(vec!["BEGIN".to_string()])
                }
                other => Err(DbError::invalid_input(format!(
                    "SQLite does not support isolation level {:?}",
                    other
                ))),
            }
        }
    }
}

fn collect_rows<R: RowToValues>(rows: Vec<R>) -> Rows {
    let columns = rows.first().map(|r| r.column_names()).unwrap_or_default();
    Rows::new(columns, rows.iter().map(|r| r.to_values()).collect())
}

mod mysql {
    use super::*;
    use sqlx::MySqlConnection;
    use sqlx::mysql::MySqlArguments;

    pub async fn execute(conn: &mut MySqlConnection, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        // Raw SQL when there are no args: some statements cannot be prepared
        let result = if args.is_empty() {
            use sqlx::Executor;
            conn.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_param(query, arg);
            }
            query.execute(&mut *conn).await?
        };
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: i64::try_from(result.last_insert_id()).ok().filter(|id| *id != 0),
        })
    }

    pub async fn fetch(conn: &mut MySqlConnection, sql: &str, args: &[Value]) -> DbResult<Rows> {
        let rows = if args.is_empty() {
            use sqlx::Executor;
            conn.fetch(sql).try_collect::<Vec<_>>().await?
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_param(query, arg);
            }
            query.fetch(&mut *conn).try_collect::<Vec<_>>().await?
        };
        Ok(collect_rows(rows))
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::MySql, MySqlArguments>,
        arg: &'q Value,
    ) -> sqlx::query::Query<'q, sqlx::MySql, MySqlArguments> {
        match arg {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Bytes(v) => query.bind(v.as_slice()),
        }
    }
}

mod postgres {
    use super::*;
    use sqlx::PgConnection;
    use sqlx::postgres::PgArguments;

    pub async fn execute(conn: &mut PgConnection, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        let result = if args.is_empty() {
            use sqlx::Executor;
            conn.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_param(query, arg);
            }
            query.execute(&mut *conn).await?
        };
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    pub async fn fetch(conn: &mut PgConnection, sql: &str, args: &[Value]) -> DbResult<Rows> {
        let rows = if args.is_empty() {
            use sqlx::Executor;
            conn.fetch(sql).try_collect::<Vec<_>>().await?
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_param(query, arg);
            }
            query.fetch(&mut *conn).try_collect::<Vec<_>>().await?
        };
        Ok(collect_rows(rows))
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
        arg: &'q Value,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
        match arg {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Bytes(v) => query.bind(v.as_slice()),
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::SqliteConnection;
    use sqlx::sqlite::SqliteArguments;

    pub async fn execute(conn: &mut SqliteConnection, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        let result = if args.is_empty() {
            use sqlx::Executor;
            conn.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_param(query, arg);
            }
            query.execute(&mut *conn).await?
        };
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_rowid()).filter(|id| *id != 0),
        })
    }

    pub async fn fetch(conn: &mut SqliteConnection, sql: &str, args: &[Value]) -> DbResult<Rows> {
        let rows = if args.is_empty() {
            use sqlx::Executor;
            conn.fetch(sql).try_collect::<Vec<_>>().await?
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_param(query, arg);
            }
            query.fetch(&mut *conn).try_collect::<Vec<_>>().await?
        };
        Ok(collect_rows(rows))
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
        arg: &'q Value,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
        match arg {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Bytes(v) => query.bind(v.as_slice()),
        }
    }
}
