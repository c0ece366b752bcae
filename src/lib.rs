//! # tenantdb
//!
//! Per-tenant database connection management for multi-tenant services.
//!
//! tenantdb provides:
//! - A cached tenant registry with single-flight metadata lookups
//! - One client per tenant, bounded by an LRU capacity limit and idle eviction
//! - A task-local operation context carrying tenant, client and request data
//! - Draining shutdown with a deadline
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tenantdb::prelude::*;
//! use tenantdb::postgres::{PgClientFactory, PgMetadataStore, Pool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     tenantdb::logging::init();
//!
//!     let control = PgClientFactory::from_url("postgres://app@control-db")?
//!         .build_pool("control")
//!         .await?;
//!
//!     let manager = TenantConnectionManager::builder()
//!         .config(TenancyConfig::from_file("tenantdb.toml")?)
//!         .store(PgMetadataStore::new(control))
//!         .factory(PgClientFactory::from_url("postgres://app@tenant-db")?)
//!         .build()?;
//!     manager.start_sweeper();
//!
//!     manager
//!         .bind("acme", RequestMeta::new().with_user_id("u-1"), async {
//!             let tenant = context::current()?;
//!             let pool = tenant.client_arc::<Pool>().ok_or("tenant pool missing")?;
//!             pool.get().await?.execute("SELECT 1", &[]).await?;
//!             Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
//!         })
//!         .await??;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use tenantdb_core::*;

/// PostgreSQL metadata store and client factory.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use tenantdb_postgres::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use tenantdb_core::context::{self, OperationContext, RequestMeta};
    pub use tenantdb_core::{
        ClientFactory, MetadataStore, TenancyConfig, TenancyError, TenancyResult,
        TenantConnectionManager, TenantId, TenantIdentifier, TenantMetadata, TenantStatus,
    };
}
