//! sqlx-backed sessions.
//!
//! A [`DbSession`] holds one pooled connection. Transactions are driven with
//! explicit SQL rather than `sqlx::Transaction`, so isolation level and access
//! mode can be applied when the transaction starts, on every backend.

use crate::db::macros::on_connection;
use crate::db::manager::TransactionSession;
use crate::db::pool::{DatabaseType, DbPool};
use crate::db::router::RoutingDataSource;
use crate::error::{TxError, TxResult};
use crate::models::{Isolation, QueryParam, TransactionDefinition};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{MySql, Postgres, Row, Sqlite};
use tracing::{debug, warn};

/// A pooled connection of one of the supported backends.
#[derive(Debug)]
pub enum DbConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl DbConnection {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbConnection::MySql(_) => DatabaseType::MySQL,
            DbConnection::Postgres(_) => DatabaseType::PostgreSQL,
            DbConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// Statements that start a transaction with `definition` on `db_type`.
pub fn begin_statements(db_type: DatabaseType, definition: &TransactionDefinition) -> Vec<String> {
    let access = if definition.read_only {
        "READ ONLY"
    } else {
        "READ WRITE"
    };
    match db_type {
        DatabaseType::PostgreSQL => {
            let statement = match definition.isolation.sql_level() {
                Some(level) => format!("BEGIN ISOLATION LEVEL {level} {access}"),
                None => format!("BEGIN {access}"),
            };
            vec![statement]
        }
        DatabaseType::MySQL => {
            // MySQL applies SET TRANSACTION to the next transaction only
            let mut statements = Vec::with_capacity(2);
            if let Some(level) = definition.isolation.sql_level() {
                statements.push(format!("SET TRANSACTION ISOLATION LEVEL {level}"));
            }
            statements.push(format!("START TRANSACTION {access}"));
            statements
        }
        DatabaseType::SQLite => {
            let mut statements = Vec::with_capacity(3);
            if definition.isolation == Isolation::ReadUncommitted {
                statements.push("PRAGMA read_uncommitted = 1".to_string());
            }
            if definition.read_only {
                statements.push("PRAGMA query_only = 1".to_string());
            }
            statements.push("BEGIN".to_string());
            statements
        }
    }
}

fn acquire_error(pool: &DbPool, error: sqlx::Error) -> TxError {
    match error {
        sqlx::Error::PoolTimedOut => {
            let secs = u32::try_from(pool.acquire_timeout().as_secs()).unwrap_or(u32::MAX);
            TxError::timeout("connection pool acquire", secs)
        }
        other => other.into(),
    }
}

fn check_savepoint_name(name: &str) -> TxResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(TxError::internal(format!("Invalid savepoint name: {name}")));
    }
    Ok(())
}

/// One pooled connection, auto-commit or inside a transaction.
#[derive(Debug)]
pub struct DbSession {
    conn: Option<DbConnection>,
    in_transaction: bool,
    read_only: bool,
    /// SQLite pragmas changed for the current transaction.
    pragmas_set: bool,
}

impl DbSession {
    /// Acquire an auto-commit session from `pool`.
    pub async fn acquire(pool: &DbPool) -> TxResult<Self> {
        let conn = match pool {
            DbPool::MySql(p) => p.acquire().await.map(DbConnection::MySql),
            DbPool::Postgres(p) => p.acquire().await.map(DbConnection::Postgres),
            DbPool::SQLite(p) => p.acquire().await.map(DbConnection::SQLite),
        }
        .map_err(|e| acquire_error(pool, e))?;
        debug!(db_type = %conn.db_type(), "Session acquired");
        Ok(Self {
            conn: Some(conn),
            in_transaction: false,
            read_only: false,
            pragmas_set: false,
        })
    }

    /// Acquire a session from `pool` and start a transaction on it.
    pub async fn begin(pool: &DbPool, definition: &TransactionDefinition) -> TxResult<Self> {
        let mut session = Self::acquire(pool).await?;
        session.begin_transaction(definition).await?;
        Ok(session)
    }

    async fn begin_transaction(&mut self, definition: &TransactionDefinition) -> TxResult<()> {
        if self.in_transaction {
            return Err(TxError::internal("Session already has a transaction in progress"));
        }
        let db_type = self.connection()?.db_type();
        let statements = begin_statements(db_type, definition);
        self.pragmas_set = db_type == DatabaseType::SQLite && statements.len() > 1;
        for statement in &statements {
            if let Err(e) = self.raw(statement).await {
                // Pragmas and SET TRANSACTION outlive a failed BEGIN
                warn!(db_type = %db_type, error = %e, "Begin failed, discarding connection");
                self.pragmas_set = false;
                self.discard();
                return Err(e);
            }
        }
        self.in_transaction = true;
        self.read_only = definition.read_only;
        debug!(
            db_type = %db_type,
            isolation = %definition.isolation,
            read_only = definition.read_only,
            "Transaction started"
        );
        Ok(())
    }

    /// Raw access to the typed connection.
    pub fn connection(&mut self) -> TxResult<&mut DbConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| TxError::internal("Session connection already released"))
    }

    pub fn db_type(&self) -> Option<DatabaseType> {
        self.conn.as_ref().map(DbConnection::db_type)
    }

    /// Execute a statement and return the number of rows affected.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> TxResult<u64> {
        let rows_affected = execute_on(self.connection()?, sql, params).await?;
        debug!(sql = %sql, rows_affected = rows_affected, "Executed statement");
        Ok(rows_affected)
    }

    /// Fetch the first column of every row as a string.
    pub async fn fetch_strings(&mut self, sql: &str, params: &[QueryParam]) -> TxResult<Vec<String>> {
        let values = fetch_strings_on(self.connection()?, sql, params).await?;
        debug!(sql = %sql, row_count = values.len(), "Fetched rows");
        Ok(values)
    }

    /// Fetch the first column of the first row as an integer.
    pub async fn fetch_i64(&mut self, sql: &str, params: &[QueryParam]) -> TxResult<i64> {
        Ok(fetch_i64_on(self.connection()?, sql, params).await?)
    }

    async fn raw(&mut self, sql: &str) -> TxResult<()> {
        Ok(raw_on(self.connection()?, sql).await?)
    }

    /// Finish the current transaction with `statement` and restore session state.
    async fn finish(&mut self, statement: &str) -> TxResult<()> {
        if !self.in_transaction {
            return Err(TxError::internal(format!(
                "{statement}: no transaction in progress"
            )));
        }
        let result = self.raw(statement).await;
        self.in_transaction = false;
        self.read_only = false;
        if result.is_err() {
            self.pragmas_set = false;
            self.discard();
        } else if self.pragmas_set {
            self.pragmas_set = false;
            if let Err(e) = self
                .raw("PRAGMA read_uncommitted = 0; PRAGMA query_only = 0")
                .await
            {
                warn!(error = %e, "Failed to reset SQLite pragmas, discarding connection");
                self.discard();
            }
        }
        result
    }

    /// Close the connection instead of returning it to the pool.
    fn discard(&mut self) {
        if let Some(conn) = self.conn.take() {
            match conn {
                DbConnection::MySql(c) => drop(c.detach()),
                DbConnection::Postgres(c) => drop(c.detach()),
                DbConnection::SQLite(c) => drop(c.detach()),
            }
        }
    }
}

// The sqlx futures are boxed where the connection is borrowed, so callers
// never hold the backend `Executor` future across an await.

fn execute_on<'a>(
    conn: &'a mut DbConnection,
    sql: &'a str,
    params: &'a [QueryParam],
) -> BoxFuture<'a, Result<u64, sqlx::Error>> {
    on_connection!(conn, |c, bind| {
        bind(sql, params)
            .execute(&mut **c)
            .map(|done| done.map(|done| done.rows_affected()))
            .boxed()
    })
}

fn fetch_strings_on<'a>(
    conn: &'a mut DbConnection,
    sql: &'a str,
    params: &'a [QueryParam],
) -> BoxFuture<'a, Result<Vec<String>, sqlx::Error>> {
    on_connection!(conn, |c, bind| {
        bind(sql, params)
            .fetch_all(&mut **c)
            .map(|rows| {
                rows?
                    .iter()
                    .map(|row| row.try_get::<String, _>(0))
                    .collect::<Result<Vec<_>, _>>()
            })
            .boxed()
    })
}

fn fetch_i64_on<'a>(
    conn: &'a mut DbConnection,
    sql: &'a str,
    params: &'a [QueryParam],
) -> BoxFuture<'a, Result<i64, sqlx::Error>> {
    on_connection!(conn, |c, bind| {
        bind(sql, params)
            .fetch_one(&mut **c)
            .map(|row| row?.try_get::<i64, _>(0))
            .boxed()
    })
}

fn raw_on<'a>(conn: &'a mut DbConnection, sql: &'a str) -> BoxFuture<'a, Result<(), sqlx::Error>> {
    on_connection!(conn, |c| {
        sqlx::Executor::execute(&mut **c, sqlx::raw_sql(sql))
            .map(|done| done.map(|_| ()))
            .boxed()
    })
}

impl TransactionSession for DbSession {
    fn is_transactional(&self) -> bool {
        self.in_transaction
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn commit(&mut self) -> TxResult<()> {
        self.finish("COMMIT").await?;
        debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> TxResult<()> {
        self.finish("ROLLBACK").await?;
        debug!("Transaction rolled back");
        Ok(())
    }

    async fn create_savepoint(&mut self, name: &str) -> TxResult<()> {
        check_savepoint_name(name)?;
        self.raw(&format!("SAVEPOINT {name}")).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> TxResult<()> {
        check_savepoint_name(name)?;
        self.raw(&format!("ROLLBACK TO SAVEPOINT {name}")).await
    }

    async fn release_savepoint(&mut self, name: &str) -> TxResult<()> {
        check_savepoint_name(name)?;
        self.raw(&format!("RELEASE SAVEPOINT {name}")).await
    }
}

impl Drop for DbSession {
    fn drop(&mut self) {
        if self.in_transaction {
            warn!("Session dropped with open transaction, closing connection");
            self.discard();
        }
    }
}

impl RoutingDataSource<DbPool> {
    /// Open an auto-commit session on the pool of the current routing key.
    pub async fn acquire(&self) -> TxResult<DbSession> {
        let pool = self.resolve()?;
        DbSession::acquire(&pool).await
    }
}
