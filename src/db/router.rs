//! Resource router.
//!
//! Maps the routing key of the current task to a registered pool handle. The
//! key is task-local: it is set for the duration of one future by
//! [`with_routing_key`] and is gone as soon as that future completes, fails,
//! panics or is dropped.

use crate::error::{TxError, TxResult};
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// Key of the read replica target.
pub const READ_KEY: &str = "read";

/// Key of the write primary target.
pub const WRITE_KEY: &str = "write";

tokio::task_local! {
    static ROUTING_KEY: String;
}

/// Run `fut` with `key` as the current routing key.
///
/// Nested calls shadow the outer key until the inner future finishes.
pub async fn with_routing_key<K, F>(key: K, fut: F) -> F::Output
where
    K: Into<String>,
    F: Future,
{
    let key = key.into();
    debug!(routing_key = %key, "Routing key set");
    ROUTING_KEY.scope(key, fut).await
}

/// The routing key of the current task, if one is set.
pub fn current_routing_key() -> Option<String> {
    ROUTING_KEY.try_with(|key| key.clone()).ok()
}

/// Demultiplexer from routing keys to pool handles.
#[derive(Debug, Clone)]
pub struct RoutingDataSource<P> {
    targets: HashMap<String, P>,
    default_key: Option<String>,
}

impl<P: Clone> RoutingDataSource<P> {
    pub fn builder() -> RoutingDataSourceBuilder<P> {
        RoutingDataSourceBuilder::new()
    }

    /// Resolve the pool for the current task's routing key, or the default pool.
    pub fn resolve(&self) -> TxResult<P> {
        self.resolve_key(current_routing_key().as_deref())
    }

    /// Resolve the pool registered under `key`, or the default pool for `None`.
    pub fn resolve_key(&self, key: Option<&str>) -> TxResult<P> {
        match key {
            Some(key) => {
                let pool = self
                    .targets
                    .get(key)
                    .ok_or_else(|| TxError::routing_key_not_registered(key, &self.keys()))?;
                debug!(routing_key = %key, "Resolved routing target");
                Ok(pool.clone())
            }
            None => {
                let default_key = self.default_key.as_deref().ok_or_else(|| {
                    TxError::configuration("No routing key set and no default target configured")
                })?;
                debug!(routing_key = %default_key, "Resolved default routing target");
                self.targets
                    .get(default_key)
                    .cloned()
                    .ok_or_else(|| TxError::routing_key_not_registered(default_key, &self.keys()))
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&P> {
        self.targets.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.targets.contains_key(key)
    }

    pub fn default_key(&self) -> Option<&str> {
        self.default_key.as_deref()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn targets(&self) -> impl Iterator<Item = (&str, &P)> {
        self.targets.iter().map(|(k, p)| (k.as_str(), p))
    }
}

/// Builder for [`RoutingDataSource`].
#[derive(Debug)]
pub struct RoutingDataSourceBuilder<P> {
    targets: HashMap<String, P>,
    default_key: Option<String>,
}

impl<P> RoutingDataSourceBuilder<P> {
    fn new() -> Self {
        Self {
            targets: HashMap::new(),
            default_key: None,
        }
    }

    /// Register `pool` under `key`. A later registration replaces an earlier one.
    pub fn target(mut self, key: impl Into<String>, pool: P) -> Self {
        self.targets.insert(key.into(), pool);
        self
    }

    pub fn default_key(mut self, key: impl Into<String>) -> Self {
        self.default_key = Some(key.into());
        self
    }

    /// Finish the router.
    ///
    /// Without an explicit default key, the `write` target becomes the default
    /// when one is registered.
    pub fn build(self) -> TxResult<RoutingDataSource<P>> {
        if self.targets.is_empty() {
            return Err(TxError::configuration(
                "At least one routing target must be registered",
            ));
        }

        let default_key = match self.default_key {
            Some(key) if !self.targets.contains_key(&key) => {
                return Err(TxError::configuration(format!(
                    "Default routing key '{}' has no registered target",
                    key
                )));
            }
            Some(key) => Some(key),
            None => self
                .targets
                .contains_key(WRITE_KEY)
                .then(|| WRITE_KEY.to_string()),
        };

        Ok(RoutingDataSource {
            targets: self.targets,
            default_key,
        })
    }
}
