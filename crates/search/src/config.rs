//! Search engine configuration.
//!
//! Settings can be built programmatically, parsed from command line arguments,
//! or read from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HELIOS_SEARCH_BATCH_SIZE` | 50 | Identifiers fetched per backend window |
//! | `HELIOS_SEARCH_DEFAULT_LOAD_SIZE` | 100 | Initial load when a search does not ask for one |
//! | `HELIOS_SEARCH_MAX_LOAD_SIZE` | 10000 | Upper bound on any requested load |
//! | `HELIOS_SEARCH_CONTINUATION_LOAD_SIZE` | 500 | Minimum rows fetched by a continuation |
//! | `HELIOS_SEARCH_WINDOW_TIMEOUT` | 30s | Maximum time for one backend window |
//! | `HELIOS_SEARCH_CACHE_TTL` | 1h | Idle time after which a search is evicted |
//! | `HELIOS_SEARCH_SWEEP_INTERVAL` | 60s | How often expired searches are swept |
//! | `HELIOS_SEARCH_REUSE_WINDOW` | 60s | Finished searches younger than this are reused (0s disables) |
//! | `HELIOS_SEARCH_DIALECT` | sqlite | Dialect reported by the in-memory store |
//! | `HELIOS_SEARCH_DATABASE_URL` | - | SQLite database file for the demo binary |
//! | `HELIOS_SEARCH_LOG_LEVEL` | info | Log level |
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use helios_search::SearchConfig;
//!
//! let config = SearchConfig {
//!     batch_size: 25,
//!     cache_ttl: Duration::from_secs(600),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::query::BackendDialect;

/// Configuration of the search coordinator.
#[derive(Debug, Clone, Parser)]
#[command(name = "helios-search")]
#[command(about = "Search coordination and result pagination demo")]
pub struct SearchConfig {
    /// Identifiers fetched from the backend cursor per window.
    #[arg(long, env = "HELIOS_SEARCH_BATCH_SIZE", default_value = "50")]
    pub batch_size: usize,

    /// Initial load size for searches that do not request one.
    #[arg(long, env = "HELIOS_SEARCH_DEFAULT_LOAD_SIZE", default_value = "100")]
    pub default_load_size: u32,

    /// Maximum load size a search may request.
    #[arg(long, env = "HELIOS_SEARCH_MAX_LOAD_SIZE", default_value = "10000")]
    pub max_load_size: u32,

    /// Minimum number of rows a continuation fetches.
    #[arg(long, env = "HELIOS_SEARCH_CONTINUATION_LOAD_SIZE", default_value = "500")]
    pub continuation_load_size: u32,

    /// Maximum duration of a single backend window (e.g. `30s`).
    #[arg(long, env = "HELIOS_SEARCH_WINDOW_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub window_timeout: Duration,

    /// Idle time after which a search and its results are evicted.
    #[arg(long, env = "HELIOS_SEARCH_CACHE_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub cache_ttl: Duration,

    /// Interval of the background eviction sweep.
    #[arg(long, env = "HELIOS_SEARCH_SWEEP_INTERVAL", default_value = "60s", value_parser = humantime::parse_duration)]
    pub sweep_interval: Duration,

    /// Age up to which a finished search is reused for an identical request.
    /// Zero disables reuse of finished searches.
    #[arg(long, env = "HELIOS_SEARCH_REUSE_WINDOW", default_value = "60s", value_parser = humantime::parse_duration)]
    pub reuse_window: Duration,

    /// Dialect reported by the in-memory store.
    #[arg(long, env = "HELIOS_SEARCH_DIALECT", default_value = "sqlite")]
    pub dialect: BackendDialect,

    /// SQLite database file; the in-memory store is used when unset.
    #[arg(long, env = "HELIOS_SEARCH_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "HELIOS_SEARCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            default_load_size: 100,
            max_load_size: 10_000,
            continuation_load_size: 500,
            window_timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            reuse_window: Duration::from_secs(60),
            dialect: BackendDialect::Sqlite,
            database_url: None,
            log_level: "info".to_string(),
        }
    }
}

impl SearchConfig {
    /// Creates a configuration from environment variables.
    ///
    /// Falls back to defaults when the environment cannot be parsed.
    pub fn from_env() -> Self {
        Self::try_parse_from(["helios-search"]).unwrap_or_default()
    }

    /// Returns the reuse window, or `None` when reuse of finished searches is off.
    pub fn effective_reuse_window(&self) -> Option<Duration> {
        (!self.reuse_window.is_zero()).then_some(self.reuse_window)
    }

    /// Clamps a requested load size into `1..=max_load_size`.
    ///
    /// Zero selects the default load size.
    pub fn clamp_load_size(&self, requested: u32) -> u32 {
        let requested = if requested == 0 {
            self.default_load_size
        } else {
            requested
        };
        requested.clamp(1, self.max_load_size.max(1))
    }

    /// Validates the configuration and returns errors if any.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push("Batch size cannot be 0".to_string());
        }

        if self.default_load_size == 0 {
            errors.push("Default load size cannot be 0".to_string());
        }

        if self.default_load_size > self.max_load_size {
            errors.push("Default load size cannot exceed max load size".to_string());
        }

        if self.continuation_load_size == 0 {
            errors.push("Continuation load size cannot be 0".to_string());
        }

        if self.continuation_load_size > self.max_load_size {
            errors.push("Continuation load size cannot exceed max load size".to_string());
        }

        if self.window_timeout.is_zero() {
            errors.push("Window timeout cannot be 0".to_string());
        }

        if self.cache_ttl.is_zero() {
            errors.push("Cache TTL cannot be 0".to_string());
        }

        if self.sweep_interval.is_zero() {
            errors.push("Sweep interval cannot be 0".to_string());
        }

        if self.reuse_window > self.cache_ttl {
            errors.push("Reuse window cannot exceed cache TTL".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validates, converting failures into a [`ConfigError`].
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|errors| ConfigError::Invalid { errors })
    }

    /// Creates a configuration suitable for testing: small windows and short timeouts.
    pub fn for_testing() -> Self {
        Self {
            batch_size: 10,
            default_load_size: 50,
            max_load_size: 1000,
            continuation_load_size: 50,
            window_timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            reuse_window: Duration::ZERO,
            dialect: BackendDialect::Sqlite,
            database_url: None,
            log_level: "debug".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SearchConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.default_load_size, 100);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.effective_reuse_window(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_humantime_arguments() {
        let config = SearchConfig::try_parse_from([
            "helios-search",
            "--window-timeout",
            "250ms",
            "--cache-ttl",
            "2h",
            "--reuse-window",
            "0s",
            "--dialect",
            "sqlserver",
        ])
        .unwrap();
        assert_eq!(config.window_timeout, Duration::from_millis(250));
        assert_eq!(config.cache_ttl, Duration::from_secs(7200));
        assert_eq!(config.effective_reuse_window(), None);
        assert_eq!(config.dialect, BackendDialect::SqlServer);
    }

    #[test]
    fn test_validate_valid() {
        assert!(SearchConfig::default().validate().is_ok());
        assert!(SearchConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_load_sizes() {
        let config = SearchConfig {
            default_load_size: 500,
            max_load_size: 100,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max load size")));
        assert!(config.check().is_err());
    }

    #[test]
    fn test_validate_continuation_load_size() {
        let config = SearchConfig {
            continuation_load_size: 2000,
            ..SearchConfig::for_testing()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(
            errors,
            vec!["Continuation load size cannot exceed max load size".to_string()]
        );
    }

    #[test]
    fn test_validate_zero_durations() {
        let config = SearchConfig {
            window_timeout: Duration::ZERO,
            batch_size: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_clamp_load_size() {
        let config = SearchConfig {
            default_load_size: 100,
            max_load_size: 1000,
            ..Default::default()
        };
        assert_eq!(config.clamp_load_size(0), 100);
        assert_eq!(config.clamp_load_size(20), 20);
        assert_eq!(config.clamp_load_size(5000), 1000);
    }
}
