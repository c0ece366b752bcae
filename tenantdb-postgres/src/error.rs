//! Error types for the PostgreSQL collaborators.

use tenantdb_core::{TenancyError, TenantId};
use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors raised while building tenant pools or reading tenant records.
#[derive(Error, Debug)]
pub enum PgError {
    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A tenant row could not be decoded.
    #[error("invalid tenant record: {0}")]
    InvalidRecord(String),
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Pool(_))
            || matches!(self, Self::Postgres(e) if e.is_closed() || e.code().is_none())
    }
}

impl PgError {
    /// Convert a failure on a tenant's own database.
    ///
    /// Connection failures become [`TenancyError::DatabaseConnection`].
    pub fn into_tenant_error(self, tenant_id: &TenantId) -> TenancyError {
        if self.is_connection_error() {
            TenancyError::DatabaseConnection {
                tenant_id: tenant_id.clone(),
                message: self.to_string(),
            }
        } else {
            self.into()
        }
    }
}

/// Connection failures without a tenant attached are reported against the
/// control database.
impl From<PgError> for TenancyError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::Config(msg) => TenancyError::Config(msg),
            err if err.is_connection_error() => TenancyError::MetadataUnavailable {
                identifier: "control database".to_string(),
                message: err.to_string(),
            },
            other => TenancyError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PgError::config("invalid URL");
        assert!(matches!(err, PgError::Config(_)));
        assert!(!err.is_connection_error());

        let err = PgError::invalid_record("unknown status: archived");
        assert_eq!(err.to_string(), "invalid tenant record: unknown status: archived");
    }

    #[test]
    fn test_into_tenancy_error() {
        let err: TenancyError = PgError::config("missing host").into();
        assert_eq!(err, TenancyError::Config("missing host".into()));

        let err: TenancyError = PgError::invalid_record("bad row").into();
        assert!(matches!(err, TenancyError::Internal(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pool_failure_is_connection_error() {
        let err = PgError::from(deadpool_postgres::PoolError::Closed);
        assert!(err.is_connection_error());

        let tenancy: TenancyError = err.into();
        assert!(tenancy.is_connection_error());
        assert!(tenancy.is_retryable());
        assert!(matches!(
            tenancy,
            TenancyError::MetadataUnavailable { ref identifier, .. } if identifier == "control database"
        ));

        let tenant = TenantId::new("t-1");
        let tenancy = PgError::from(deadpool_postgres::PoolError::Closed).into_tenant_error(&tenant);
        assert!(tenancy.is_connection_error());
        assert!(matches!(
            tenancy,
            TenancyError::DatabaseConnection { ref tenant_id, .. } if *tenant_id == tenant
        ));

        let tenancy = PgError::config("bad url").into_tenant_error(&tenant);
        assert_eq!(tenancy, TenancyError::Config("bad url".into()));
    }
}
