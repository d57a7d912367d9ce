//! Configuration handling for the transaction router.
//!
//! This module provides configuration management via CLI arguments and environment
//! variables, and validation of the data sources the router is built from.

use crate::db::router::{READ_KEY, WRITE_KEY};
use crate::error::{TxError, TxResult};
use clap::Parser;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_MESSAGE: &str = "hello from tx-router";

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10 for MySQL/PostgreSQL, 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to test connections before use (default: true)
    pub test_before_acquire: Option<bool>,
}

impl PoolOptions {
    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    /// Get min_connections with default value.
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    /// Get test_before_acquire with default value.
    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if min == 0 {
                return Err("min_connections must be greater than 0".to_string());
            }
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Validated map of routing key to connection URL.
///
/// Always contains non-empty `write` and `read` entries.
#[derive(Debug, Clone)]
pub struct DataSources {
    urls: BTreeMap<String, String>,
}

impl DataSources {
    /// Build from `key=url` entries plus the dedicated write/read URLs.
    ///
    /// The dedicated URLs override entries with the same key.
    pub fn from_parts(
        sources: &[String],
        write_url: Option<&str>,
        read_url: Option<&str>,
    ) -> TxResult<Self> {
        let mut urls = BTreeMap::new();
        for source in sources {
            let (key, url) = Self::parse_source(source)?;
            urls.insert(key, url);
        }
        for (key, url) in [(WRITE_KEY, write_url), (READ_KEY, read_url)] {
            if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
                urls.insert(key.to_string(), Self::check_url(key, url)?);
            }
        }

        for (key, option) in [(WRITE_KEY, "--write-url"), (READ_KEY, "--read-url")] {
            if !urls.contains_key(key) {
                return Err(TxError::configuration(format!(
                    "Missing '{key}' data source: set {option} or pass --source {key}=<url>"
                )));
            }
        }

        Ok(Self { urls })
    }

    /// Parse a `key=url` entry.
    fn parse_source(s: &str) -> TxResult<(String, String)> {
        // Only split on an '=' that comes before the scheme separator
        let scheme_pos = s.find("://").unwrap_or(s.len());
        let Some(idx) = s[..scheme_pos].find('=') else {
            return Err(TxError::configuration(format!(
                "Invalid data source '{s}': expected key=url"
            )));
        };
        let key = s[..idx].trim();
        if key.is_empty() {
            return Err(TxError::configuration(format!(
                "Invalid data source '{s}': key cannot be empty"
            )));
        }
        let url = Self::check_url(key, s[idx + 1..].trim())?;
        Ok((key.to_string(), url))
    }

    fn check_url(key: &str, url: &str) -> TxResult<String> {
        if url.is_empty() {
            return Err(TxError::configuration(format!(
                "Data source '{key}' has an empty URL"
            )));
        }
        Url::parse(url).map_err(|e| {
            TxError::configuration(format!("Data source '{key}' has an invalid URL: {e}"))
        })?;
        Ok(url.to_string())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.urls.get(key).map(String::as_str)
    }

    pub fn write_url(&self) -> &str {
        self.get(WRITE_KEY).unwrap_or_default()
    }

    pub fn read_url(&self) -> &str {
        self.get(READ_KEY).unwrap_or_default()
    }

    /// Default routing key.
    pub fn default_key(&self) -> &'static str {
        WRITE_KEY
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.urls.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Configuration for the tx-router demo.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tx-router",
    about = "Declarative read/write transaction routing over SQL databases",
    version,
    author
)]
pub struct Config {
    /// Connection URL of the write primary.
    #[arg(long, value_name = "URL", env = "TX_WRITE_URL")]
    pub write_url: Option<String>,

    /// Connection URL of the read replica.
    #[arg(long, value_name = "URL", env = "TX_READ_URL")]
    pub read_url: Option<String>,

    /// Additional routing targets.
    /// Format: "key=connection_string"
    /// Can be specified multiple times or as comma-separated values.
    #[arg(
        short = 's',
        long = "source",
        value_name = "KEY=URL",
        env = "TX_SOURCES",
        value_delimiter = ','
    )]
    pub sources: Vec<String>,

    /// Maximum connections per pool
    #[arg(long, env = "TX_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    /// Connection acquire timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS,
        env = "TX_ACQUIRE_TIMEOUT"
    )]
    pub acquire_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TX_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "TX_JSON_LOGS")]
    pub json_logs: bool,

    /// Message written by the demo run
    #[arg(long, default_value = DEFAULT_MESSAGE, env = "TX_MESSAGE")]
    pub message: String,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            write_url: None,
            read_url: None,
            sources: Vec::new(),
            max_connections: None,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            log_level: "info".to_string(),
            json_logs: false,
            message: DEFAULT_MESSAGE.to_string(),
        }
    }

    /// Validate and collect the configured data sources.
    pub fn data_sources(&self) -> TxResult<DataSources> {
        DataSources::from_parts(
            &self.sources,
            self.write_url.as_deref(),
            self.read_url.as_deref(),
        )
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            acquire_timeout_secs: Some(self.acquire_timeout),
            ..PoolOptions::default()
        }
    }

    /// Get the acquire timeout as a Duration.
    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
