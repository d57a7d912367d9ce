//! Instrumentation models: log levels and call-site identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two orthogonal logging facets a call can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogFacets {
    /// Log call start and finish.
    pub wrap: bool,
    /// Log elapsed duration.
    pub time: bool,
}

impl LogFacets {
    pub const NONE: LogFacets = LogFacets {
        wrap: false,
        time: false,
    };
    pub const WRAP: LogFacets = LogFacets {
        wrap: true,
        time: false,
    };
    pub const TIME: LogFacets = LogFacets {
        wrap: false,
        time: true,
    };
    pub const ALL: LogFacets = LogFacets {
        wrap: true,
        time: true,
    };
}

/// Declared log level of an intercepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[default]
    Off,
    Wrap,
    Time,
    All,
}

impl LogLevel {
    pub fn facets(&self) -> LogFacets {
        match self {
            Self::Off => LogFacets::NONE,
            Self::Wrap => LogFacets::WRAP,
            Self::Time => LogFacets::TIME,
            Self::All => LogFacets::ALL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Wrap => "WRAP",
            Self::Time => "TIME",
            Self::All => "ALL",
        }
    }
}

impl From<LogFacets> for LogLevel {
    fn from(facets: LogFacets) -> Self {
        match (facets.wrap, facets.time) {
            (false, false) => Self::Off,
            (true, false) => Self::Wrap,
            (false, true) => Self::Time,
            (true, true) => Self::All,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OFF" => Ok(Self::Off),
            "WRAP" => Ok(Self::Wrap),
            "TIME" => Ok(Self::Time),
            "ALL" => Ok(Self::All),
            _ => Err(format!("Unknown log level: {s}")),
        }
    }
}

/// Identity of an intercepted call, used for log and metric tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub type_name: &'static str,
    pub method: &'static str,
}

impl CallSite {
    pub const fn new(type_name: &'static str, method: &'static str) -> Self {
        Self { type_name, method }
    }

    /// `Type.method`, the key used by operation tables and metrics.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.type_name, self.method)
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facets_match_level() {
        assert_eq!(LogLevel::Off.facets(), LogFacets::NONE);
        assert!(LogLevel::Wrap.facets().wrap && !LogLevel::Wrap.facets().time);
        assert!(!LogLevel::Time.facets().wrap && LogLevel::Time.facets().time);
        assert_eq!(LogLevel::All.facets(), LogFacets::ALL);
    }

    #[test]
    fn test_level_from_facets_is_inverse() {
        for level in [LogLevel::Off, LogLevel::Wrap, LogLevel::Time, LogLevel::All] {
            assert_eq!(LogLevel::from(level.facets()), level);
        }
    }

    #[test]
    fn test_call_site_name() {
        let site = CallSite::new("AccountRepository", "save");
        assert_eq!(site.qualified_name(), "AccountRepository.save");
        assert_eq!(site.to_string(), "AccountRepository.save");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("all".parse::<LogLevel>().unwrap(), LogLevel::All);
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
