//! Transaction executor.
//!
//! Runs a unit of work inside a transaction boundary on the write-side or
//! read-side manager. The configuration is passed by reference per call and
//! never stored, so one service can be shared freely between tasks.

use crate::db::manager::TransactionManager;
use crate::error::{TxError, TxResult};
use crate::models::{Propagation, Side, TransactionConfiguration};
use crate::tx::scope::{Participation, TxScope};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::debug;

/// Entry point for transactional units of work.
pub struct TransactionService<M: TransactionManager> {
    write: Arc<M>,
    read: Arc<M>,
}

impl<M: TransactionManager> Clone for TransactionService<M> {
    fn clone(&self) -> Self {
        Self {
            write: Arc::clone(&self.write),
            read: Arc::clone(&self.read),
        }
    }
}

impl<M: TransactionManager> std::fmt::Debug for TransactionService<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionService")
            .field("write", &self.write.name())
            .field("read", &self.read.name())
            .finish()
    }
}

impl<M: TransactionManager> TransactionService<M> {
    pub fn new(write: Arc<M>, read: Arc<M>) -> Self {
        Self { write, read }
    }

    pub fn write_manager(&self) -> &Arc<M> {
        &self.write
    }

    pub fn read_manager(&self) -> &Arc<M> {
        &self.read
    }

    /// A fresh scope with no active transaction.
    pub fn scope(&self) -> TxScope<M> {
        TxScope::new(Arc::clone(&self.write), Arc::clone(&self.read))
    }

    /// Run `work` on the write-side manager.
    pub async fn run_write<T, F>(&self, config: &TransactionConfiguration, work: F) -> TxResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send,
    {
        let mut scope = self.scope();
        execute(&mut scope, Side::Write, config, work).await
    }

    /// Run `work` on the read-side manager. Transactions begun here are read-only.
    pub async fn run_read<T, F>(&self, config: &TransactionConfiguration, work: F) -> TxResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send,
    {
        let mut scope = self.scope();
        execute(&mut scope, Side::Read, config, work).await
    }
}

/// Decide how a call with `propagation` relates to `existing`, the owner of the
/// transaction already active on its side.
pub(crate) fn participation(
    propagation: Propagation,
    existing: Option<usize>,
) -> TxResult<Participation> {
    use Propagation::*;

    match (propagation, existing) {
        (Required | Supports | Mandatory, Some(owner)) => Ok(Participation::Join(owner)),
        (Nested, Some(owner)) => Ok(Participation::Savepoint(owner)),
        (RequiresNew, _) | (Required | Nested, None) => Ok(Participation::New),
        (NotSupported, _) | (Supports | Never, None) => Ok(Participation::NonTransactional),
        (Mandatory, None) => Err(TxError::illegal_state(
            Mandatory,
            "No existing transaction found for transaction marked with propagation 'mandatory'",
        )),
        (Never, Some(_)) => Err(TxError::illegal_state(
            Never,
            "Existing transaction found for transaction marked with propagation 'never'",
        )),
    }
}

/// Run `work` as one call on `scope`.
///
/// Propagation violations fail before anything is pushed, so the unit of
/// work never runs. Isolation only applies when this call begins a new
/// transaction.
pub(crate) async fn execute<M, T, F>(
    scope: &mut TxScope<M>,
    side: Side,
    config: &TransactionConfiguration,
    work: F,
) -> TxResult<T>
where
    M: TransactionManager,
    T: Send,
    F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send,
{
    let propagation = config.propagation();
    let definition = config.definition(side);
    let existing = scope.active_owner(side);
    let participation = participation(propagation, existing)?;

    debug!(
        side = %side,
        propagation = %propagation,
        isolation = %definition.isolation,
        participation = ?participation,
        depth = scope.depth(),
        "Entering transactional call"
    );

    scope
        .push(side, propagation, participation, &definition)
        .await?;
    let result = work(scope).await;
    scope.pop(result).await
}
