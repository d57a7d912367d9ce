//! Data models for the transaction router.
//!
//! This module re-exports all model types used throughout the crate.

pub mod instrumentation;
pub mod query;
pub mod transaction;

// Re-export commonly used types
pub use instrumentation::{CallSite, LogFacets, LogLevel};
pub use query::QueryParam;
pub use transaction::{
    CompletionStatus, Isolation, Propagation, Side, TransactionConfiguration,
    TransactionDefinition,
};
