//! Transaction manager capability.
//!
//! A [`TransactionManager`] hands out sessions bound to one physical resource
//! (the write primary or a read replica). The executor owns the sessions it
//! obtains: a session that is lower on the call stack while another one runs is
//! what "suspended" means here, and popping the newer frame resumes it.

use crate::error::TxResult;
use crate::models::TransactionDefinition;
use std::future::Future;

/// A connection-like handle, either auto-commit or inside a transaction.
pub trait TransactionSession: Send {
    /// True while a transaction begun on this session is open.
    fn is_transactional(&self) -> bool;

    fn is_read_only(&self) -> bool;

    fn commit(&mut self) -> impl Future<Output = TxResult<()>> + Send;

    fn rollback(&mut self) -> impl Future<Output = TxResult<()>> + Send;

    fn create_savepoint(&mut self, name: &str) -> impl Future<Output = TxResult<()>> + Send;

    fn rollback_to_savepoint(&mut self, name: &str) -> impl Future<Output = TxResult<()>> + Send;

    fn release_savepoint(&mut self, name: &str) -> impl Future<Output = TxResult<()>> + Send;
}

/// Begins transactions against one physical resource.
pub trait TransactionManager: Send + Sync + 'static {
    type Session: TransactionSession + 'static;

    /// Short label used in logs ("write", "read", ...).
    fn name(&self) -> &str;

    /// Open an auto-commit session, used by calls that run without a transaction.
    fn open(&self) -> impl Future<Output = TxResult<Self::Session>> + Send;

    /// Start a new physical transaction.
    fn begin(
        &self,
        definition: &TransactionDefinition,
    ) -> impl Future<Output = TxResult<Self::Session>> + Send;
}
