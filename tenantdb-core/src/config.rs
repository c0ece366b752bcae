//! Configuration for the tenant connection manager.
//!
//! Configuration is usually loaded from a `tenantdb.toml` file:
//!
//! ```toml
//! [registry]
//! ttl = "60s"
//! negative_ttl = "0s"
//! lookup_timeout = "5s"
//!
//! [pool]
//! max_open_pools = 100
//! idle_timeout = "5m"
//! sweep_interval = "30s"
//! connect_timeout = "30s"
//!
//! [shutdown]
//! drain_timeout = "30s"
//! ```
//!
//! `${VAR}` references are expanded from the process environment before
//! parsing. Every table and key is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TenancyError, TenancyResult};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TenancyConfig {
    /// Metadata cache settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Per-tenant pool settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Shutdown settings.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl TenancyConfig {
    /// Create a builder starting from the defaults.
    pub fn builder() -> TenancyConfigBuilder {
        TenancyConfigBuilder::default()
    }

    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> TenancyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TenancyError::config(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> TenancyResult<Self> {
        let expanded = expand_env_vars(content);

        let config: Self = toml::from_str(&expanded)
            .map_err(|e| TenancyError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values for consistency.
    pub fn validate(&self) -> TenancyResult<()> {
        if self.pool.max_open_pools == 0 {
            return Err(TenancyError::config("pool.max_open_pools must be at least 1"));
        }
        if self.pool.sweep_interval.is_zero() {
            return Err(TenancyError::config("pool.sweep_interval must be non-zero"));
        }
        if self.pool.connect_timeout.is_zero() {
            return Err(TenancyError::config("pool.connect_timeout must be non-zero"));
        }
        if self.registry.lookup_timeout.is_zero() {
            return Err(TenancyError::config(
                "registry.lookup_timeout must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Metadata cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// How long a resolved tenant is served from cache. Zero disables caching.
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// How long a "not found" answer is cached. Zero disables negative caching.
    #[serde(default, with = "humantime_serde")]
    pub negative_ttl: Duration,

    /// Upper bound on a single metadata store call.
    #[serde(default = "default_lookup_timeout", with = "humantime_serde")]
    pub lookup_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            negative_ttl: Duration::ZERO,
            lookup_timeout: default_lookup_timeout(),
        }
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_lookup_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Per-tenant pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum number of tenant pools open at once.
    #[serde(default = "default_max_open_pools")]
    pub max_open_pools: usize,

    /// Unreferenced pools idle longer than this are closed by the sweeper.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How often the idle sweeper runs.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Upper bound on a single pool construction.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open_pools: default_max_open_pools(),
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_max_open_pools() -> usize {
    100
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Shutdown settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    /// How long shutdown waits for in-flight operations before force-closing.
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Builder for [`TenancyConfig`].
#[derive(Debug, Clone, Default)]
pub struct TenancyConfigBuilder {
    config: TenancyConfig,
}

impl TenancyConfigBuilder {
    /// Set the metadata cache TTL.
    pub fn registry_ttl(mut self, ttl: Duration) -> Self {
        self.config.registry.ttl = ttl;
        self
    }

    /// Set the negative cache TTL.
    pub fn negative_ttl(mut self, ttl: Duration) -> Self {
        self.config.registry.negative_ttl = ttl;
        self
    }

    /// Set the metadata lookup timeout.
    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.config.registry.lookup_timeout = timeout;
        self
    }

    /// Set the maximum number of open tenant pools.
    pub fn max_open_pools(mut self, max: usize) -> Self {
        self.config.pool.max_open_pools = max;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.idle_timeout = timeout;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.pool.sweep_interval = interval;
        self
    }

    /// Set the pool construction timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.connect_timeout = timeout;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown.drain_timeout = timeout;
        self
    }

    /// Build and validate the config.
    pub fn build(self) -> TenancyResult<TenancyConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Expand environment variables in the format `${VAR_NAME}`.
///
/// Unset variables are left as written.
fn expand_env_vars(content: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = TenancyConfig::default();
        assert_eq!(config.registry.ttl, Duration::from_secs(60));
        assert_eq!(config.registry.negative_ttl, Duration::ZERO);
        assert_eq!(config.pool.max_open_pools, 100);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [registry]
            ttl = "2m"
            negative_ttl = "10s"
            lookup_timeout = "1s"

            [pool]
            max_open_pools = 8
            idle_timeout = "90s"
            sweep_interval = "15s"
            connect_timeout = "3s"

            [shutdown]
            drain_timeout = "5s"
        "#;

        let config = TenancyConfig::from_str(toml).unwrap();
        assert_eq!(config.registry.ttl, Duration::from_secs(120));
        assert_eq!(config.registry.negative_ttl, Duration::from_secs(10));
        assert_eq!(config.pool.max_open_pools, 8);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.pool.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = TenancyConfig::from_str("[pool]\nmax_open_pools = 3\n").unwrap();
        assert_eq!(config.pool.max_open_pools, 3);
        assert_eq!(config.pool.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = TenancyConfig::from_str("[pool]\nmax_pools = 3\n").unwrap_err();
        assert!(matches!(err, TenancyError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = TenancyConfig::from_str("[pool]\nmax_open_pools = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_open_pools"));

        assert!(TenancyConfig::builder().max_open_pools(0).build().is_err());
    }

    #[test]
    fn test_env_var_expansion() {
        // SAFETY: the variable name is unique to this test.
        unsafe {
            std::env::set_var("TENANTDB_TEST_MAX_POOLS", "7");
        }
        let expanded = expand_env_vars("max_open_pools = ${TENANTDB_TEST_MAX_POOLS}");
        assert_eq!(expanded, "max_open_pools = 7");
        unsafe {
            std::env::remove_var("TENANTDB_TEST_MAX_POOLS");
        }

        assert_eq!(
            expand_env_vars("url = \"${TENANTDB_TEST_UNSET_VAR}\""),
            "url = \"${TENANTDB_TEST_UNSET_VAR}\""
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenantdb.toml");
        std::fs::write(&path, "[shutdown]\ndrain_timeout = \"45s\"\n").unwrap();

        let config = TenancyConfig::from_file(&path).unwrap();
        assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(45));

        let missing = TenancyConfig::from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(TenancyError::Config(_))));
    }

    #[test]
    fn test_builder() {
        let config = TenancyConfig::builder()
            .registry_ttl(Duration::from_secs(10))
            .max_open_pools(2)
            .idle_timeout(Duration::from_secs(1))
            .drain_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(config.registry.ttl, Duration::from_secs(10));
        assert_eq!(config.pool.max_open_pools, 2);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(1));
        assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(5));
    }
}
