//! Database abstraction layer.
//!
//! This module provides the resources transactions run against:
//! - Resource routing by task-scoped key
//! - The transaction manager capability and its sqlx and in-memory backends
//! - Connection pool management and parameter binding for sqlx

mod macros;
pub mod manager;
pub mod memory;
pub mod params;
pub mod pool;
pub mod router;
pub mod session;
pub mod sqlx_manager;

pub use manager::{TransactionManager, TransactionSession};
pub use memory::{MemoryDatabase, MemorySession, MemoryTransactionManager};
pub use pool::{DatabaseType, DbPool};
pub use router::{
    READ_KEY, RoutingDataSource, RoutingDataSourceBuilder, WRITE_KEY, current_routing_key,
    with_routing_key,
};
pub use session::{DbConnection, DbSession};
pub use sqlx_manager::SqlxTransactionManager;
