//! Declarative transaction management.
//!
//! - [`TransactionService`]: runs units of work under propagation and isolation rules
//! - [`TxScope`]: the call-stack transaction state units of work nest through
//! - [`ExecutionStrategy`]: logging and metrics around a unit of work
//! - [`TxInterceptor`]: resolves declarations and drives the pieces above

pub mod interceptor;
pub mod scope;
pub mod service;
pub mod strategy;

pub use interceptor::{Declaration, OperationTable, TxInterceptor, TxSettings};
pub use scope::TxScope;
pub use service::TransactionService;
pub use strategy::ExecutionStrategy;
