//! Declarative read/write transaction routing.
//!
//! Units of work are declared as read or write operations. The crate picks the
//! physical resource (read replica or write primary), wraps the call in a
//! transaction boundary with the declared propagation and isolation, and
//! instruments it with optional structured logging and metrics.
//!
//! ```ignore
//! let service = TransactionService::new(write, read);
//! let interceptor = TxInterceptor::new(service, metrics);
//!
//! interceptor
//!     .tx_write(CallSite::new("Accounts", "open"), TxSettings::new(), |scope| {
//!         Box::pin(async move {
//!             scope.session().await?.execute("INSERT INTO accounts (name) VALUES (?)", &["a".into()]).await?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod tx;

pub use config::Config;
pub use error::{TxError, TxResult};
pub use metrics::{Metrics, MetricsRegistry, MetricsSink};
pub use models::{CallSite, Isolation, LogLevel, Propagation, TransactionConfiguration};
pub use tx::{Declaration, OperationTable, TransactionService, TxInterceptor, TxScope, TxSettings};
