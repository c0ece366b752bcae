//! # tenantdb-postgres
//!
//! PostgreSQL collaborators for `tenantdb-core`:
//!
//! - [`PgClientFactory`] opens a `deadpool_postgres::Pool` per tenant database
//! - [`PgMetadataStore`] reads tenant records from a control database
//!
//! ## Example
//!
//! ```rust,ignore
//! use tenantdb_core::{RequestMeta, TenantConnectionManager, TenancyConfig, context};
//! use tenantdb_postgres::{PgClientFactory, PgMetadataStore};
//!
//! let control = PgClientFactory::from_url("postgres://app@control-db")?
//!     .build_pool("control")
//!     .await?;
//!
//! let manager = TenantConnectionManager::new(
//!     TenancyConfig::from_file("tenantdb.toml")?,
//!     PgMetadataStore::new(control),
//!     PgClientFactory::from_url("postgres://app@tenant-db?max_connections=8")?,
//! )?;
//! manager.start_sweeper();
//!
//! let count: i64 = manager
//!     .bind("acme", RequestMeta::new().with_generated_request_id(), async {
//!         let pool = context::current()?
//!             .client_arc::<deadpool_postgres::Pool>()
//!             .ok_or("tenant pool missing")?;
//!         let client = pool.get().await?;
//!         let row = client.query_one("SELECT count(*) FROM orders", &[]).await?;
//!         Ok::<_, Box<dyn std::error::Error + Send + Sync>>(row.get(0))
//!     })
//!     .await??;
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod store;

pub use config::PgServerConfig;
pub use error::{PgError, PgResult};
pub use factory::PgClientFactory;
pub use store::PgMetadataStore;

// Re-export the driver types callers handle directly.
pub use deadpool_postgres::{Object as PooledClient, Pool};
pub use tokio_postgres::Row;
