//! Error types for tenant resolution, pool management and context access.
//!
//! Every failure the manager surfaces is a [`TenancyError`]. The enum is
//! `Clone` so that a single failed metadata lookup or pool construction can be
//! handed to every caller that was waiting on it.
//!
//! # Error Codes
//!
//! Error codes follow a pattern: T{category}{number}
//! - 1xxx: Tenant resolution (not found, suspended)
//! - 2xxx: Connectivity (metadata store, client factory)
//! - 3xxx: Capacity and lifecycle (exhausted, shutting down)
//! - 4xxx: Context access
//! - 7xxx: Configuration
//! - 9xxx: Internal
//!
//! ```rust
//! use tenantdb_core::{ErrorCode, TenancyError};
//!
//! let err = TenancyError::not_found("acme");
//! assert_eq!(err.code(), ErrorCode::TenantNotFound);
//! assert_eq!(err.code().code(), "T1001");
//! assert!(!err.is_retryable());
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::metadata::{TenantId, TenantIdentifier};

/// Result type for tenancy operations.
pub type TenancyResult<T> = Result<T, TenancyError>;

/// Boxed error returned by injected collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by a [`MetadataStore`](crate::MetadataStore).
pub type StoreError = BoxError;

/// Error returned by a [`ClientFactory`](crate::ClientFactory).
pub type ClientError = BoxError;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Tenant does not exist or is pending deletion (T1001).
    TenantNotFound = 1001,
    /// Tenant exists but is suspended (T1002).
    TenantSuspended = 1002,
    /// Metadata store failed or timed out (T2001).
    MetadataUnavailable = 2001,
    /// Client factory failed or timed out (T2002).
    ConnectionFailed = 2002,
    /// No idle pool could be evicted to make room (T3001).
    ResourceExhausted = 3001,
    /// Shutdown has started (T3002).
    ShuttingDown = 3002,
    /// Context read outside a bound operation (T4001).
    NoActiveContext = 4001,
    /// Invalid configuration (T7001).
    InvalidConfiguration = 7001,
    /// Internal error (T9001).
    Internal = 9001,
}

impl ErrorCode {
    /// Get the error code string (e.g., "T1001").
    pub fn code(&self) -> String {
        format!("T{}", *self as u16)
    }

    /// Get a short description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::TenantNotFound => "Tenant not found",
            Self::TenantSuspended => "Tenant suspended",
            Self::MetadataUnavailable => "Tenant metadata unavailable",
            Self::ConnectionFailed => "Tenant database connection failed",
            Self::ResourceExhausted => "Tenant pool capacity exhausted",
            Self::ShuttingDown => "Shutting down",
            Self::NoActiveContext => "No active tenant context",
            Self::InvalidConfiguration => "Invalid configuration",
            Self::Internal => "Internal error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors that can occur while resolving tenants and handing out pools.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TenancyError {
    /// The identifier did not resolve, or the tenant is pending deletion.
    #[error("tenant not found: {identifier}")]
    TenantNotFound {
        /// The slug or id that was looked up.
        identifier: String,
    },

    /// The tenant exists but is suspended.
    #[error("tenant {tenant_id} is suspended")]
    TenantSuspended {
        /// The suspended tenant.
        tenant_id: TenantId,
        /// When the tenant may be reactivated, if known.
        reactivation_deadline: Option<DateTime<Utc>>,
    },

    /// The metadata store failed or did not answer in time.
    #[error("tenant metadata unavailable for {identifier}: {message}")]
    MetadataUnavailable {
        /// The slug or id that was looked up.
        identifier: String,
        /// Underlying failure.
        message: String,
    },

    /// The client factory failed or did not answer in time.
    #[error("database connection error for tenant {tenant_id}: {message}")]
    DatabaseConnection {
        /// The tenant whose pool could not be built.
        tenant_id: TenantId,
        /// Underlying failure.
        message: String,
    },

    /// Every open pool is in use and none can be evicted.
    #[error("all {max_open_pools} tenant pools are in use")]
    ResourceExhausted {
        /// The configured bound.
        max_open_pools: usize,
    },

    /// The ambient context was read outside a bound operation.
    #[error("no active tenant context")]
    NoActiveContext,

    /// Shutdown has started; no new acquisitions are accepted.
    #[error("tenant connection manager is shutting down")]
    ShuttingDown,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TenancyError {
    /// Create a not found error.
    pub fn not_found(identifier: impl fmt::Display) -> Self {
        Self::TenantNotFound {
            identifier: identifier.to_string(),
        }
    }

    /// Create a suspended error.
    pub fn suspended(tenant_id: TenantId, reactivation_deadline: Option<DateTime<Utc>>) -> Self {
        Self::TenantSuspended {
            tenant_id,
            reactivation_deadline,
        }
    }

    /// Create a metadata unavailable error.
    pub fn metadata_unavailable(identifier: &TenantIdentifier, cause: impl fmt::Display) -> Self {
        Self::MetadataUnavailable {
            identifier: identifier.to_string(),
            message: cause.to_string(),
        }
    }

    /// Create a database connection error.
    pub fn connection(tenant_id: &TenantId, cause: impl fmt::Display) -> Self {
        Self::DatabaseConnection {
            tenant_id: tenant_id.clone(),
            message: cause.to_string(),
        }
    }

    /// Create a resource exhausted error.
    pub fn resource_exhausted(max_open_pools: usize) -> Self {
        Self::ResourceExhausted { max_open_pools }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TenantNotFound { .. } => ErrorCode::TenantNotFound,
            Self::TenantSuspended { .. } => ErrorCode::TenantSuspended,
            Self::MetadataUnavailable { .. } => ErrorCode::MetadataUnavailable,
            Self::DatabaseConnection { .. } => ErrorCode::ConnectionFailed,
            Self::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            Self::NoActiveContext => ErrorCode::NoActiveContext,
            Self::ShuttingDown => ErrorCode::ShuttingDown,
            Self::Config(_) => ErrorCode::InvalidConfiguration,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Check if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TenantNotFound { .. })
    }

    /// Check if this is a suspended error.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::TenantSuspended { .. })
    }

    /// Check if this is a connection error (metadata store or client factory).
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::MetadataUnavailable { .. } | Self::DatabaseConnection { .. }
        )
    }

    /// Check if the caller may retry later.
    ///
    /// Nothing is retried inside the manager itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MetadataUnavailable { .. }
                | Self::DatabaseConnection { .. }
                | Self::ResourceExhausted { .. }
        )
    }

    /// The reactivation deadline of a suspended tenant.
    pub fn reactivation_deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::TenantSuspended {
                reactivation_deadline,
                ..
            } => *reactivation_deadline,
            _ => None,
        }
    }
}
