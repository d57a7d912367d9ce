//! Interception pipeline.
//!
//! Turns a call's declaration into behaviour. Transactional declarations
//! build a fresh [`TransactionConfiguration`], pick an [`ExecutionStrategy`]
//! and run through the transaction executor with the strategy wrapped around
//! the real call. Routing declarations set the routing key for the duration
//! of the call and open no transaction.
//!
//! Declarations come either from the entry point used ([`TxInterceptor::tx_write`],
//! [`TxInterceptor::route`], ...) or from an [`OperationTable`] consulted by
//! [`TxInterceptor::invoke`].

use crate::db::manager::TransactionManager;
use crate::db::router::{READ_KEY, WRITE_KEY, with_routing_key};
use crate::error::TxResult;
use crate::metrics::Metrics;
use crate::models::{
    CallSite, Isolation, LogLevel, Propagation, Side, TransactionConfiguration,
};
use crate::tx::scope::TxScope;
use crate::tx::service::{TransactionService, execute};
use crate::tx::strategy::ExecutionStrategy;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Declared settings of a transactional call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxSettings {
    pub propagation: Propagation,
    pub isolation: Isolation,
    pub log_level: LogLevel,
    pub instrumented: bool,
}

impl TxSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn with_instrumented(mut self, instrumented: bool) -> Self {
        self.instrumented = instrumented;
        self
    }

    /// The immutable configuration handed to the executor.
    pub fn configuration(&self) -> TransactionConfiguration {
        if self.instrumented {
            TransactionConfiguration::instrumented(self.propagation, self.isolation)
        } else {
            TransactionConfiguration::new(self.propagation, self.isolation)
        }
    }
}

/// Everything a call can declare about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    /// Read-side transaction.
    TxRead(TxSettings),
    /// Write-side transaction.
    TxWrite(TxSettings),
    /// Route to the read target, no transaction.
    Read,
    /// Route to the write target, no transaction.
    Write,
    /// Route to a custom target, no transaction.
    Route(String),
}

/// Registration table from `Type.method` to a declaration.
#[derive(Debug, Clone, Default)]
pub struct OperationTable {
    entries: HashMap<String, Declaration>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `declaration` for `site`, replacing any earlier entry.
    pub fn register(mut self, site: CallSite, declaration: Declaration) -> Self {
        self.entries.insert(site.qualified_name(), declaration);
        self
    }

    pub fn insert(&mut self, operation: impl Into<String>, declaration: Declaration) {
        self.entries.insert(operation.into(), declaration);
    }

    pub fn lookup(&self, site: &CallSite) -> Option<&Declaration> {
        self.entries.get(&site.qualified_name())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The interception pipeline over a [`TransactionService`].
pub struct TxInterceptor<M: TransactionManager> {
    service: TransactionService<M>,
    metrics: Metrics,
    table: Arc<OperationTable>,
}

impl<M: TransactionManager> Clone for TxInterceptor<M> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            metrics: self.metrics.clone(),
            table: Arc::clone(&self.table),
        }
    }
}

impl<M: TransactionManager> std::fmt::Debug for TxInterceptor<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxInterceptor")
            .field("service", &self.service)
            .field("metrics", &self.metrics)
            .field("operations", &self.table.len())
            .finish()
    }
}

impl<M: TransactionManager> TxInterceptor<M> {
    pub fn new(service: TransactionService<M>, metrics: Metrics) -> Self {
        Self {
            service,
            metrics,
            table: Arc::new(OperationTable::new()),
        }
    }

    pub fn with_table(mut self, table: OperationTable) -> Self {
        self.table = Arc::new(table);
        self
    }

    pub fn service(&self) -> &TransactionService<M> {
        &self.service
    }

    pub fn table(&self) -> &OperationTable {
        &self.table
    }

    /// Run `work` as a write-side transactional call.
    pub async fn tx_write<T, F>(&self, site: CallSite, settings: TxSettings, work: F) -> TxResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send + 'static,
    {
        let mut scope = self.service.scope();
        self.transactional(&mut scope, Side::Write, site, settings, work)
            .await
    }

    /// Run `work` as a read-side transactional call.
    pub async fn tx_read<T, F>(&self, site: CallSite, settings: TxSettings, work: F) -> TxResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send + 'static,
    {
        let mut scope = self.service.scope();
        self.transactional(&mut scope, Side::Read, site, settings, work)
            .await
    }

    /// [`tx_write`](Self::tx_write) nested in the caller's scope.
    pub async fn tx_write_in<T, F>(
        &self,
        scope: &mut TxScope<M>,
        site: CallSite,
        settings: TxSettings,
        work: F,
    ) -> TxResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send + 'static,
    {
        self.transactional(scope, Side::Write, site, settings, work)
            .await
    }

    /// [`tx_read`](Self::tx_read) nested in the caller's scope.
    pub async fn tx_read_in<T, F>(
        &self,
        scope: &mut TxScope<M>,
        site: CallSite,
        settings: TxSettings,
        work: F,
    ) -> TxResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send + 'static,
    {
        self.transactional(scope, Side::Read, site, settings, work)
            .await
    }

    /// Run `work` with `key` as the routing key. No transaction is opened.
    pub async fn route<K, Fut, T>(&self, key: K, work: Fut) -> TxResult<T>
    where
        K: Into<String>,
        Fut: Future<Output = TxResult<T>>,
    {
        with_routing_key(key, work).await
    }

    /// [`route`](Self::route) for a scope-taking unit of work.
    pub async fn route_in<K, T, F>(&self, scope: &mut TxScope<M>, key: K, work: F) -> TxResult<T>
    where
        K: Into<String>,
        T: Send,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send,
    {
        with_routing_key(key, work(scope)).await
    }

    /// Run `work` as declared for `site` in the operation table.
    ///
    /// Operations missing from the table run directly, with no transaction
    /// and no routing key.
    pub async fn invoke<T, F>(&self, site: CallSite, work: F) -> TxResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send + 'static,
    {
        let mut scope = self.service.scope();
        self.invoke_in(&mut scope, site, work).await
    }

    /// [`invoke`](Self::invoke) nested in the caller's scope.
    pub async fn invoke_in<T, F>(&self, scope: &mut TxScope<M>, site: CallSite, work: F) -> TxResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send + 'static,
    {
        match self.table.lookup(&site).cloned() {
            Some(Declaration::TxWrite(settings)) => {
                self.transactional(scope, Side::Write, site, settings, work)
                    .await
            }
            Some(Declaration::TxRead(settings)) => {
                self.transactional(scope, Side::Read, site, settings, work)
                    .await
            }
            Some(Declaration::Write) => self.route_in(scope, WRITE_KEY, work).await,
            Some(Declaration::Read) => self.route_in(scope, READ_KEY, work).await,
            Some(Declaration::Route(key)) => self.route_in(scope, key, work).await,
            None => {
                debug!(call_site = %site, "No declaration registered, running directly");
                work(scope).await
            }
        }
    }

    async fn transactional<T, F>(
        &self,
        scope: &mut TxScope<M>,
        side: Side,
        site: CallSite,
        settings: TxSettings,
        work: F,
    ) -> TxResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut TxScope<M>) -> BoxFuture<'c, TxResult<T>> + Send + 'static,
    {
        let config = settings.configuration();
        let strategy = ExecutionStrategy::select(config.is_instrumented(), &self.metrics);
        let level = settings.log_level;

        execute(scope, side, &config, move |scope| {
            Box::pin(async move { strategy.execute_with(level, &site, work(scope)).await })
        })
        .await
    }
}
