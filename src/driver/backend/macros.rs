//! Backend dispatch macros.
//!
//! The macros expand to a plain `match` over the connection variants so each
//! arm stays linear and readable.

/// Database backend behind a sqlx connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    MySql,
    Postgres,
    SQLite,
}

impl DatabaseType {
    /// Detect the backend from a connection URL's scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::SQLite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::SQLite => "sqlite",
        }
    }
}

/// Generate match arms over the variants of a physical connection.
///
/// ```ignore
/// impl_db_dispatch!(conn, {
///     MySql(c) => mysql::execute(c, sql, args).await,
///     Postgres(c) => postgres::execute(c, sql, args).await,
///     SQLite(c) => sqlite::execute(c, sql, args).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::driver::backend::Physical::$variant($c) => $body,
            )+
        }
    };
}
