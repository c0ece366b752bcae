//! The tenant connection manager facade.
//!
//! [`TenantConnectionManager`] wires a [`TenantRegistry`], a [`PoolCache`] and
//! a [`LifecycleManager`] together from one [`TenancyConfig`].
//!
//! ```rust
//! use tenantdb_core::{RequestMeta, StaticMetadataStore, TenantConnectionManager, TenantMetadata};
//! # use tenantdb_core::{ClientError, ClientFactory};
//! # struct Noop;
//! # #[async_trait::async_trait]
//! # impl ClientFactory for Noop {
//! #     type Client = String;
//! #     async fn create_client(&self, database: &str) -> Result<String, ClientError> { Ok(database.into()) }
//! #     async fn close_client(&self, _: &String) -> Result<(), ClientError> { Ok(()) }
//! # }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tenantdb_core::TenancyResult<()> {
//! let store = StaticMetadataStore::new();
//! store.register(TenantMetadata::new("t-1", "acme", "Acme Corp", "db_acme"));
//!
//! let manager = TenantConnectionManager::builder()
//!     .store(store)
//!     .factory(Noop)
//!     .max_open_pools(50)
//!     .build()?;
//!
//! let database = manager
//!     .bind("acme", RequestMeta::new(), async {
//!         tenantdb_core::context::with_current(|ctx| ctx.client::<String>().cloned())
//!     })
//!     .await??;
//! assert_eq!(database.as_deref(), Some("db_acme"));
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::client::ClientFactory;
use crate::config::TenancyConfig;
use crate::context::{self, RequestMeta};
use crate::error::{TenancyError, TenancyResult};
use crate::lifecycle::{DrainReport, LifecycleManager};
use crate::metadata::{MetadataStore, TenantId, TenantIdentifier, TenantMetadata};
use crate::pool::{PoolCache, PoolLease, PoolStats};
use crate::registry::TenantRegistry;

/// Maps tenants to live clients and binds them to operations.
pub struct TenantConnectionManager<F: ClientFactory> {
    config: TenancyConfig,
    registry: TenantRegistry,
    pools: PoolCache<F>,
    lifecycle: LifecycleManager,
}

impl<F: ClientFactory> TenantConnectionManager<F> {
    /// Create a manager. The config is validated; no pool is opened.
    pub fn new(
        config: TenancyConfig,
        store: impl MetadataStore + 'static,
        factory: F,
    ) -> TenancyResult<Self> {
        Self::from_parts(config, Arc::new(store), factory)
    }

    fn from_parts(
        config: TenancyConfig,
        store: Arc<dyn MetadataStore>,
        factory: F,
    ) -> TenancyResult<Self> {
        config.validate()?;

        let registry = TenantRegistry::from_arc(store, config.registry.clone());
        let pools = PoolCache::new(factory, registry.clone(), config.pool.clone());

        Ok(Self {
            config,
            registry,
            pools,
            lifecycle: LifecycleManager::new(),
        })
    }

    /// Create a builder.
    pub fn builder() -> TenantConnectionManagerBuilder<F> {
        TenantConnectionManagerBuilder::default()
    }

    /// Run `operation` with the tenant's context bound.
    /// See [`context::bind`].
    pub async fn bind<Fut: Future>(
        &self,
        tenant: impl Into<TenantIdentifier>,
        request: RequestMeta,
        operation: Fut,
    ) -> TenancyResult<Fut::Output> {
        context::bind(&self.pools, tenant, request, operation).await
    }

    /// Lease a tenant's client directly.
    pub async fn acquire(
        &self,
        tenant: impl Into<TenantIdentifier>,
    ) -> TenancyResult<PoolLease<F>> {
        self.pools.acquire(tenant).await
    }

    /// Resolve a tenant's metadata.
    pub async fn resolve(
        &self,
        tenant: impl Into<TenantIdentifier>,
    ) -> TenancyResult<Arc<TenantMetadata>> {
        self.registry.resolve(tenant).await
    }

    /// Force the next resolve of a tenant to hit the metadata store.
    pub fn invalidate(&self, tenant_id: &TenantId) {
        self.registry.invalidate(tenant_id);
    }

    /// Start the background idle sweeper. Returns `false` if it is already
    /// running or shutdown has begun. Must be called inside a Tokio runtime.
    pub fn start_sweeper(&self) -> bool {
        self.lifecycle.start_sweeper(&self.pools)
    }

    /// Run one idle sweep now.
    pub async fn sweep_idle(&self) -> usize {
        self.pools.sweep_idle().await
    }

    /// Shut down using the configured drain timeout.
    pub async fn shutdown(&self) -> DrainReport {
        self.shutdown_with_timeout(self.config.shutdown.drain_timeout)
            .await
    }

    /// Shut down, waiting at most `drain_timeout` for in-flight operations.
    pub async fn shutdown_with_timeout(&self, drain_timeout: Duration) -> DrainReport {
        self.lifecycle.shutdown(&self.pools, drain_timeout).await
    }

    /// Check if shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }

    /// Get the registry.
    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// Get the pool cache.
    pub fn pools(&self) -> &PoolCache<F> {
        &self.pools
    }

    /// Get the config.
    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.pools.stats()
    }
}

impl<F: ClientFactory> std::fmt::Debug for TenantConnectionManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConnectionManager")
            .field("config", &self.config)
            .field("pools", &self.pools)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

/// Builder for [`TenantConnectionManager`].
pub struct TenantConnectionManagerBuilder<F: ClientFactory> {
    config: TenancyConfig,
    store: Option<Arc<dyn MetadataStore>>,
    factory: Option<F>,
}

impl<F: ClientFactory> Default for TenantConnectionManagerBuilder<F> {
    fn default() -> Self {
        Self {
            config: TenancyConfig::default(),
            store: None,
            factory: None,
        }
    }
}

impl<F: ClientFactory> TenantConnectionManagerBuilder<F> {
    /// Replace the whole config.
    pub fn config(mut self, config: TenancyConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the metadata store.
    pub fn store(mut self, store: impl MetadataStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set the client factory.
    pub fn factory(mut self, factory: F) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the maximum number of open tenant pools.
    pub fn max_open_pools(mut self, max: usize) -> Self {
        self.config.pool.max_open_pools = max;
        self
    }

    /// Set the metadata cache TTL.
    pub fn registry_ttl(mut self, ttl: Duration) -> Self {
        self.config.registry.ttl = ttl;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.idle_timeout = timeout;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown.drain_timeout = timeout;
        self
    }

    /// Build the manager.
    pub fn build(self) -> TenancyResult<TenantConnectionManager<F>> {
        let store = self
            .store
            .ok_or_else(|| TenancyError::config("a metadata store is required"))?;
        let factory = self
            .factory
            .ok_or_else(|| TenancyError::config("a client factory is required"))?;

        TenantConnectionManager::from_parts(self.config, store, factory)
    }
}
