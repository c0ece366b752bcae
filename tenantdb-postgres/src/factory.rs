//! A [`ClientFactory`] that opens one deadpool pool per tenant database.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tenantdb_core::{ClientError, ClientFactory};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::config::PgServerConfig;
use crate::error::{PgError, PgResult};

/// Builds a `deadpool_postgres::Pool` for each tenant database.
///
/// The tenant's pool is the "client" the pool cache lends out; operations
/// check connections out of it with `pool.get().await`.
#[derive(Debug, Clone)]
pub struct PgClientFactory {
    config: PgServerConfig,
}

impl PgClientFactory {
    /// Create a factory from validated server settings.
    pub fn new(config: PgServerConfig) -> PgResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create a factory from a server URL.
    pub fn from_url(url: &str) -> PgResult<Self> {
        Self::new(PgServerConfig::from_url(url)?)
    }

    /// Get the server settings.
    pub fn config(&self) -> &PgServerConfig {
        &self.config
    }

    /// Build the pool for one database without registering it anywhere.
    pub async fn build_pool(&self, database: &str) -> PgResult<Pool> {
        let pg_config = self.config.to_pg_config(database)?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);

        let pool = Pool::builder(mgr)
            .max_size(self.config.max_connections)
            .wait_timeout(Some(self.config.connection_timeout))
            .create_timeout(Some(self.config.connection_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| PgError::config(format!("failed to create pool: {}", e)))?;

        if self.config.verify_on_create {
            let client = pool.get().await?;
            client.query_one("SELECT 1", &[]).await?;
            debug!(database, "Tenant database connection verified");
        }

        info!(
            database,
            host = %self.config.host,
            max_connections = self.config.max_connections,
            "Tenant PostgreSQL pool created"
        );

        Ok(pool)
    }
}

#[async_trait]
impl ClientFactory for PgClientFactory {
    type Client = Pool;

    async fn create_client(&self, database: &str) -> Result<Pool, ClientError> {
        Ok(self.build_pool(database).await?)
    }

    async fn close_client(&self, pool: &Pool) -> Result<(), ClientError> {
        let status = pool.status();
        pool.close();
        debug!(
            size = status.size,
            available = status.available,
            "Tenant PostgreSQL pool closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_factory() -> PgClientFactory {
        PgClientFactory::new(PgServerConfig::new("localhost").verify_on_create(false)).unwrap()
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let err = PgClientFactory::new(PgServerConfig::new("localhost").max_connections(0))
            .unwrap_err();
        assert!(matches!(err, PgError::Config(_)));

        assert!(PgClientFactory::from_url("postgres://localhost").is_ok());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_database() {
        let factory = offline_factory();
        let err = factory.create_client("db; DROP TABLE x").await.unwrap_err();
        assert!(err.to_string().contains("invalid database name"));
    }

    #[tokio::test]
    async fn test_unverified_pool_is_lazy_and_closes() {
        let factory = offline_factory();

        // No connection is attempted until the first checkout.
        let pool = factory.create_client("db_acme").await.unwrap();
        assert_eq!(pool.status().max_size, 10);
        assert_eq!(pool.status().size, 0);

        factory.close_client(&pool).await.unwrap();
        assert!(pool.is_closed());
    }
}
