//! Transaction configuration models.
//!
//! A [`TransactionConfiguration`] is built once per call and never mutated
//! afterwards; the executor receives it by reference and derives a
//! [`TransactionDefinition`] for the side it runs on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a unit of work relates to a transaction already active on its call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Join the active transaction, or start a new one.
    #[default]
    Required,
    /// Suspend the active transaction and always start an independent one.
    RequiresNew,
    /// Run inside a savepoint of the active transaction, or start a new one.
    Nested,
    /// Join the active transaction, or run without one.
    Supports,
    /// Suspend the active transaction and run without one.
    NotSupported,
    /// Join the active transaction; fail if there is none.
    Mandatory,
    /// Run without a transaction; fail if one is active.
    Never,
}

impl Propagation {
    pub const ALL: [Propagation; 7] = [
        Propagation::Required,
        Propagation::RequiresNew,
        Propagation::Nested,
        Propagation::Supports,
        Propagation::NotSupported,
        Propagation::Mandatory,
        Propagation::Never,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "REQUIRED",
            Self::RequiresNew => "REQUIRES_NEW",
            Self::Nested => "NESTED",
            Self::Supports => "SUPPORTS",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Mandatory => "MANDATORY",
            Self::Never => "NEVER",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Propagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown propagation: {s}"))
    }
}

/// Visibility of concurrent changes to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Isolation {
    /// Whatever the underlying resource uses by default.
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    pub const ALL: [Isolation; 5] = [
        Isolation::Default,
        Isolation::ReadUncommitted,
        Isolation::ReadCommitted,
        Isolation::RepeatableRead,
        Isolation::Serializable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::ReadUncommitted => "READ_UNCOMMITTED",
            Self::ReadCommitted => "READ_COMMITTED",
            Self::RepeatableRead => "REPEATABLE_READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// SQL spelling used in `SET TRANSACTION ISOLATION LEVEL ...`.
    /// `None` for [`Isolation::Default`].
    pub fn sql_level(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::Serializable => Some("SERIALIZABLE"),
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown isolation: {s}"))
    }
}

/// Which transaction manager a call is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Write,
    Read,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable per-call transaction configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionConfiguration {
    propagation: Propagation,
    isolation: Isolation,
    /// Record duration/error metrics for this call.
    instrumented: bool,
}

impl TransactionConfiguration {
    pub const fn new(propagation: Propagation, isolation: Isolation) -> Self {
        Self {
            propagation,
            isolation,
            instrumented: false,
        }
    }

    pub const fn instrumented(propagation: Propagation, isolation: Isolation) -> Self {
        Self {
            propagation,
            isolation,
            instrumented: true,
        }
    }

    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn is_instrumented(&self) -> bool {
        self.instrumented
    }

    /// The definition handed to the transaction manager of `side`.
    ///
    /// Read-side definitions are always read-only.
    pub fn definition(&self, side: Side) -> TransactionDefinition {
        TransactionDefinition {
            isolation: self.isolation,
            read_only: side == Side::Read,
        }
    }
}

/// What a transaction manager needs to begin a physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionDefinition {
    pub isolation: Isolation,
    pub read_only: bool,
}

impl TransactionDefinition {
    pub fn read_write(isolation: Isolation) -> Self {
        Self {
            isolation,
            read_only: false,
        }
    }

    pub fn read_only(isolation: Isolation) -> Self {
        Self {
            isolation,
            read_only: true,
        }
    }
}

/// Outcome passed to completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Committed,
    RolledBack,
}
