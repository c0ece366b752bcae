//! Integration tests for loading configuration and building a manager from it.

mod common;

use std::io::Write;
use std::time::Duration;

use common::{MemoryFactory, tenant_store};
use pretty_assertions::assert_eq;
use tenantdb::{TenancyConfig, TenancyError, TenantConnectionManager};

/// Test loading a full configuration file
#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
        [registry]
        ttl = "2m"
        negative_ttl = "5s"

        [pool]
        max_open_pools = 25
        idle_timeout = "10m"
        sweep_interval = "1m"

        [shutdown]
        drain_timeout = "45s"
        "#
    )
    .unwrap();

    let config = TenancyConfig::from_file(file.path()).unwrap();

    assert_eq!(config.registry.ttl, Duration::from_secs(120));
    assert_eq!(config.registry.negative_ttl, Duration::from_secs(5));
    assert_eq!(config.registry.lookup_timeout, Duration::from_secs(5));
    assert_eq!(config.pool.max_open_pools, 25);
    assert_eq!(config.pool.idle_timeout, Duration::from_secs(600));
    assert_eq!(config.pool.sweep_interval, Duration::from_secs(60));
    assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(45));
}

/// Test an empty file yields the defaults
#[test]
fn test_config_empty_file() {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    let config = TenancyConfig::from_file(file.path()).unwrap();
    assert_eq!(config, TenancyConfig::default());
}

/// Test a missing file is a configuration error
#[test]
fn test_config_missing_file() {
    let err = TenancyConfig::from_file("/nonexistent/tenantdb.toml").unwrap_err();
    assert!(matches!(err, TenancyError::Config(_)));
}

/// Test invalid values are rejected
#[test]
fn test_config_invalid_values() {
    let err = TenancyConfig::from_str("[pool]\nmax_open_pools = 0").unwrap_err();
    assert!(err.to_string().contains("max_open_pools"));

    let err = TenancyConfig::from_str("[pool]\nidle_timeout = \"soon\"").unwrap_err();
    assert!(matches!(err, TenancyError::Config(_)));

    let err = TenancyConfig::from_str("[pools]\nmax_open_pools = 3").unwrap_err();
    assert!(matches!(err, TenancyError::Config(_)));
}

/// Test the loaded configuration drives the manager
#[tokio::test]
async fn test_manager_from_config() {
    let config = TenancyConfig::from_str(
        r#"
        [pool]
        max_open_pools = 1
        "#,
    )
    .unwrap();

    let factory = MemoryFactory::default();
    let manager = TenantConnectionManager::new(config, tenant_store(), factory.clone()).unwrap();
    assert_eq!(manager.config().pool.max_open_pools, 1);

    let _acme = manager.acquire("acme").await.unwrap();
    let err = manager.acquire("globex").await.unwrap_err();
    assert_eq!(err, TenancyError::ResourceExhausted { max_open_pools: 1 });
}
