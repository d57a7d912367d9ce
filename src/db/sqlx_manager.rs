//! [`TransactionManager`] over sqlx pools.

use crate::db::manager::TransactionManager;
use crate::db::pool::DbPool;
use crate::db::router::RoutingDataSource;
use crate::db::session::DbSession;
use crate::error::TxResult;
use crate::models::TransactionDefinition;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
enum PoolSource {
    Fixed(DbPool),
    /// Looked up through the router under a fixed key on every begin.
    Routed {
        router: Arc<RoutingDataSource<DbPool>>,
        key: String,
    },
}

/// Transaction manager bound to one sqlx pool.
#[derive(Debug, Clone)]
pub struct SqlxTransactionManager {
    name: String,
    source: PoolSource,
}

impl SqlxTransactionManager {
    pub fn new(name: impl Into<String>, pool: DbPool) -> Self {
        Self {
            name: name.into(),
            source: PoolSource::Fixed(pool),
        }
    }

    /// A manager whose pool is the router's target for `key`.
    pub fn routed(router: Arc<RoutingDataSource<DbPool>>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            source: PoolSource::Routed { router, key },
        }
    }

    pub fn pool(&self) -> TxResult<DbPool> {
        match &self.source {
            PoolSource::Fixed(pool) => Ok(pool.clone()),
            PoolSource::Routed { router, key } => router.resolve_key(Some(key)),
        }
    }
}

impl TransactionManager for SqlxTransactionManager {
    type Session = DbSession;

    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> TxResult<DbSession> {
        let pool = self.pool()?;
        debug!(manager = %self.name, "Opening non-transactional session");
        DbSession::acquire(&pool).await
    }

    async fn begin(&self, definition: &TransactionDefinition) -> TxResult<DbSession> {
        let pool = self.pool()?;
        debug!(
            manager = %self.name,
            isolation = %definition.isolation,
            read_only = definition.read_only,
            "Beginning transaction"
        );
        DbSession::begin(&pool, definition).await
    }
}
