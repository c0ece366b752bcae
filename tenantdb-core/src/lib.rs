//! # tenantdb-core
//!
//! Per-tenant database connection management for multi-tenant services.
//!
//! Each inbound operation names a tenant by slug or id. The manager resolves
//! that tenant through a cached [`TenantRegistry`], leases the tenant's
//! client from a bounded [`PoolCache`], and binds an [`OperationContext`]
//! around the operation so that nested code can read it with
//! [`context::current`].
//!
//! ## Components
//!
//! - [`metadata`] - tenant records and the [`MetadataStore`] seam
//! - [`registry`] - TTL cache with single-flight lookups and status checks
//! - [`client`] - the [`ClientFactory`] seam to a database driver
//! - [`pool`] - one client per tenant, LRU capacity bound, idle eviction
//! - [`context`] - task-local operation context
//! - [`lifecycle`] - idle sweeper and draining shutdown
//! - [`manager`] - [`TenantConnectionManager`], the facade tying them together
//!
//! ## Errors
//!
//! Every operation returns [`TenancyResult`]. Errors carry a stable
//! [`ErrorCode`] and are never retried internally; see [`TenancyError::is_retryable`].

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod metadata;
pub mod pool;
pub mod registry;

#[cfg(test)]
mod testing;

pub use client::ClientFactory;
pub use config::{PoolConfig, RegistryConfig, ShutdownConfig, TenancyConfig, TenancyConfigBuilder};
pub use context::{OperationContext, RequestMeta};
pub use error::{BoxError, ClientError, ErrorCode, StoreError, TenancyError, TenancyResult};
pub use lifecycle::{DrainReport, IdleSweeper, LifecycleManager};
pub use manager::{TenantConnectionManager, TenantConnectionManagerBuilder};
pub use metadata::{
    MetadataStore, StaticMetadataStore, TenantId, TenantIdentifier, TenantMetadata, TenantStatus,
    UnknownStatus,
};
pub use pool::{PoolCache, PoolEntrySnapshot, PoolLease, PoolState, PoolStats};
pub use registry::{RegistryMetrics, TenantRegistry};
