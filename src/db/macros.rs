//! Backend dispatch macros for [`DbConnection`](crate::db::session::DbConnection).
//!
//! Each arm is expanded separately, so the body is type-checked once per
//! backend while the call site stays a single readable expression.

/// Run `$body` against the backend-specific connection held by `$conn`.
///
/// The two-binding form also brings the matching parameter binder from
/// [`params`](crate::db::params) into scope as `$bind`.
///
/// ```ignore
/// let fut = on_connection!(conn, |c, bind| {
///     bind(sql, params).execute(&mut **c).map(|r| r.map(|d| d.rows_affected())).boxed()
/// });
/// ```
macro_rules! on_connection {
    ($conn:expr, |$c:ident, $bind:ident| $body:expr) => {
        match $conn {
            $crate::db::session::DbConnection::MySql($c) => {
                let $bind = $crate::db::params::mysql_query;
                $body
            }
            $crate::db::session::DbConnection::Postgres($c) => {
                let $bind = $crate::db::params::postgres_query;
                $body
            }
            $crate::db::session::DbConnection::SQLite($c) => {
                let $bind = $crate::db::params::sqlite_query;
                $body
            }
        }
    };
    ($conn:expr, |$c:ident| $body:expr) => {
        match $conn {
            $crate::db::session::DbConnection::MySql($c) => $body,
            $crate::db::session::DbConnection::Postgres($c) => $body,
            $crate::db::session::DbConnection::SQLite($c) => $body,
        }
    };
}

pub(crate) use on_connection;
