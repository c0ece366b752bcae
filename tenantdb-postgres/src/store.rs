//! A [`MetadataStore`] backed by a tenants table.
//!
//! The table lives in a control database, separate from tenant databases:
//!
//! ```sql
//! CREATE TABLE tenants (
//!     id                    UUID PRIMARY KEY,
//!     slug                  TEXT NOT NULL UNIQUE,
//!     name                  TEXT NOT NULL,
//!     status                TEXT NOT NULL DEFAULT 'active',
//!     database_name         TEXT NOT NULL,
//!     reactivation_deadline TIMESTAMPTZ
//! );
//! ```
//!
//! Any id column type that casts to text works.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tenantdb_core::{MetadataStore, StoreError, TenantId, TenantMetadata, TenantStatus};
use tokio_postgres::Row;
use tracing::debug;

use crate::config::validate_identifier;
use crate::error::{PgError, PgResult};

const DEFAULT_TABLE: &str = "tenants";

/// Reads tenant records from PostgreSQL.
#[derive(Clone)]
pub struct PgMetadataStore {
    pool: Pool,
    by_slug: String,
    by_id: String,
}

impl PgMetadataStore {
    /// Read from the `tenants` table.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            by_slug: select_sql(DEFAULT_TABLE, "slug"),
            by_id: select_sql(DEFAULT_TABLE, "id::text"),
        }
    }

    /// Read from another table, optionally schema-qualified (`control.tenants`).
    pub fn with_table(pool: Pool, table: &str) -> PgResult<Self> {
        for part in table.split('.') {
            validate_identifier("table", part)?;
        }
        if table.split('.').count() > 2 {
            return Err(PgError::config(format!("invalid table name: {:?}", table)));
        }

        Ok(Self {
            pool,
            by_slug: select_sql(table, "slug"),
            by_id: select_sql(table, "id::text"),
        })
    }

    async fn fetch(&self, sql: &str, key: &str) -> PgResult<Option<TenantMetadata>> {
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(sql).await?;
        let row = client.query_opt(&stmt, &[&key]).await?;
        debug!(key, found = row.is_some(), "Tenant record fetched");
        row.as_ref().map(tenant_from_row).transpose()
    }
}

impl std::fmt::Debug for PgMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgMetadataStore")
            .field("by_slug", &self.by_slug)
            .field("pool", &self.pool.status())
            .finish()
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn lookup_by_slug(&self, slug: &str) -> Result<Option<TenantMetadata>, StoreError> {
        Ok(self.fetch(&self.by_slug, slug).await?)
    }

    async fn lookup_by_id(&self, id: &TenantId) -> Result<Option<TenantMetadata>, StoreError> {
        Ok(self.fetch(&self.by_id, id.as_str()).await?)
    }
}

fn select_sql(table: &str, key_column: &str) -> String {
    format!(
        "SELECT id::text, slug, name, status, database_name, reactivation_deadline \
         FROM {} WHERE {} = $1",
        table, key_column
    )
}

fn tenant_from_row(row: &Row) -> PgResult<TenantMetadata> {
    let id: String = row.try_get(0)?;
    let status: String = row.try_get(3)?;
    let status = status
        .parse::<TenantStatus>()
        .map_err(|e| PgError::invalid_record(format!("tenant {}: {}", id, e)))?;
    let reactivation_deadline: Option<DateTime<Utc>> = row.try_get(5)?;

    let slug: String = row.try_get(1)?;
    let name: String = row.try_get(2)?;
    let database: String = row.try_get(4)?;

    let mut metadata = TenantMetadata::new(id, slug, name, database).with_status(status);
    metadata.reactivation_deadline = reactivation_deadline;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PgServerConfig;
    use crate::factory::PgClientFactory;
    use pretty_assertions::assert_eq;

    async fn lazy_pool() -> Pool {
        PgClientFactory::new(PgServerConfig::new("localhost").verify_on_create(false))
            .unwrap()
            .build_pool("control")
            .await
            .unwrap()
    }

    #[test]
    fn test_select_sql() {
        assert_eq!(
            select_sql("tenants", "slug"),
            "SELECT id::text, slug, name, status, database_name, reactivation_deadline \
             FROM tenants WHERE slug = $1"
        );
    }

    #[tokio::test]
    async fn test_with_table_validates_name() {
        let pool = lazy_pool().await;

        let store = PgMetadataStore::with_table(pool.clone(), "control.tenants").unwrap();
        assert!(store.by_id.ends_with("FROM control.tenants WHERE id::text = $1"));

        assert!(PgMetadataStore::with_table(pool.clone(), "tenants; DROP").is_err());
        assert!(PgMetadataStore::with_table(pool.clone(), "ctl-db.tenants").is_err());
        assert!(PgMetadataStore::with_table(pool.clone(), "tenant-records").is_err());
        assert!(PgMetadataStore::with_table(pool.clone(), "a.b.c").is_err());
        assert!(PgMetadataStore::with_table(pool, "").is_err());
    }
}
