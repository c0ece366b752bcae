//! Ambient operation context.
//!
//! [`bind`] leases a tenant's client, builds an [`OperationContext`] and makes
//! it visible to everything the operation awaits, through Tokio task-local
//! storage. Nested code reads it with [`current`] instead of threading it
//! through every signature.
//!
//! - The context follows the operation across `.await` points, and only that
//!   operation: concurrent operations on the same worker thread each see their
//!   own.
//! - A nested [`bind`] shadows the outer context for its own extent.
//! - The lease is released when the operation finishes, fails or is dropped.
//! - Tasks started with `tokio::spawn` do not inherit the context; wrap them
//!   with [`scope`] to carry it over.
//!
//! # Example
//!
//! ```rust,ignore
//! use tenantdb_core::context::{self, RequestMeta};
//!
//! let users = context::bind(&pools, "acme", RequestMeta::new().with_user_id("u-1"), async {
//!     let ctx = context::current()?;
//!     let pool = ctx.client::<deadpool_postgres::Pool>().expect("postgres client");
//!     load_users(pool).await
//! })
//! .await??;
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::client::ClientFactory;
use crate::error::{TenancyError, TenancyResult};
use crate::metadata::{TenantId, TenantIdentifier, TenantMetadata, TenantStatus};
use crate::pool::PoolCache;

tokio::task_local! {
    /// Context of the operation running on this task.
    static OPERATION_CONTEXT: Arc<OperationContext>;
}

/// Opaque per-request data supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Correlation id.
    pub request_id: Option<String>,
    /// Authenticated user.
    pub user_id: Option<String>,
    /// Roles granted to the user.
    pub user_roles: Vec<String>,
}

impl RequestMeta {
    /// Create empty request metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set a freshly generated request id.
    pub fn with_generated_request_id(self) -> Self {
        self.with_request_id(uuid::Uuid::new_v4().to_string())
    }

    /// Set the user id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Add a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.user_roles.push(role.into());
        self
    }

    /// Replace the roles.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// Everything nested code may need about the operation it runs in.
///
/// The client is borrowed from the tenant's pool entry; it must not be closed
/// or kept beyond the operation.
pub struct OperationContext {
    tenant: Arc<TenantMetadata>,
    client: Arc<dyn Any + Send + Sync>,
    request: RequestMeta,
    created_at: DateTime<Utc>,
}

impl OperationContext {
    /// Compose a context from resolved metadata, a client and request data.
    pub fn new(
        tenant: Arc<TenantMetadata>,
        client: Arc<dyn Any + Send + Sync>,
        request: RequestMeta,
    ) -> Self {
        Self {
            tenant,
            client,
            request,
            created_at: Utc::now(),
        }
    }

    /// The tenant id.
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant.id
    }

    /// The tenant slug.
    pub fn tenant_slug(&self) -> &str {
        &self.tenant.slug
    }

    /// The tenant display name.
    pub fn tenant_name(&self) -> &str {
        &self.tenant.name
    }

    /// The tenant status at resolve time.
    pub fn tenant_status(&self) -> TenantStatus {
        self.tenant.status
    }

    /// The full metadata snapshot.
    pub fn metadata(&self) -> &Arc<TenantMetadata> {
        &self.tenant
    }

    /// The tenant's client, if it is a `C`.
    pub fn client<C: Any>(&self) -> Option<&C> {
        self.client.downcast_ref::<C>()
    }

    /// A shared handle to the tenant's client, if it is a `C`.
    pub fn client_arc<C: Any + Send + Sync>(&self) -> Option<Arc<C>> {
        Arc::clone(&self.client).downcast::<C>().ok()
    }

    /// The request metadata.
    pub fn request(&self) -> &RequestMeta {
        &self.request
    }

    /// The request id.
    pub fn request_id(&self) -> Option<&str> {
        self.request.request_id.as_deref()
    }

    /// The user id.
    pub fn user_id(&self) -> Option<&str> {
        self.request.user_id.as_deref()
    }

    /// The user's roles.
    pub fn user_roles(&self) -> &[String] {
        &self.request.user_roles
    }

    /// Check if the user has a role.
    pub fn has_role(&self, role: &str) -> bool {
        self.request.user_roles.iter().any(|r| r == role)
    }

    /// When the context was bound.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("tenant_id", &self.tenant.id)
            .field("tenant_slug", &self.tenant.slug)
            .field("tenant_status", &self.tenant.status)
            .field("request", &self.request)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Run `operation` with a context for `tenant` bound around it.
///
/// Acquisition errors are returned before `operation` is polled. The lease is
/// held until `operation` completes, and released if this future is dropped
/// first.
pub async fn bind<F, Fut>(
    pools: &PoolCache<F>,
    tenant: impl Into<TenantIdentifier>,
    request: RequestMeta,
    operation: Fut,
) -> TenancyResult<Fut::Output>
where
    F: ClientFactory,
    Fut: Future,
{
    let lease = pools.acquire(tenant).await?;

    let client: Arc<dyn Any + Send + Sync> = lease.client_arc();
    let context = Arc::new(OperationContext::new(
        Arc::clone(lease.metadata()),
        client,
        request,
    ));

    let span = tracing::debug_span!(
        "tenant_operation",
        tenant_id = %context.tenant_id(),
        request_id = context.request_id().unwrap_or_default(),
    );
    let output = OPERATION_CONTEXT
        .scope(context, operation)
        .instrument(span)
        .await;

    lease.release();
    Ok(output)
}

/// Run `operation` with an existing context bound, e.g. inside a spawned
/// task that belongs to the same operation.
pub async fn scope<Fut: Future>(context: Arc<OperationContext>, operation: Fut) -> Fut::Output {
    OPERATION_CONTEXT.scope(context, operation).await
}

/// Run a synchronous closure with a context bound.
pub fn scope_sync<R>(context: Arc<OperationContext>, f: impl FnOnce() -> R) -> R {
    OPERATION_CONTEXT.sync_scope(context, f)
}

/// The context of the current operation.
///
/// Fails with [`TenancyError::NoActiveContext`] outside [`bind`]. Calling this
/// outside a bound operation is a programming error.
#[inline]
pub fn current() -> TenancyResult<Arc<OperationContext>> {
    OPERATION_CONTEXT
        .try_with(Arc::clone)
        .map_err(|_| TenancyError::NoActiveContext)
}

/// The context of the current operation, if any.
#[inline]
pub fn try_current() -> Option<Arc<OperationContext>> {
    OPERATION_CONTEXT.try_with(Arc::clone).ok()
}

/// Read the current context without cloning the handle.
#[inline]
pub fn with_current<T>(f: impl FnOnce(&OperationContext) -> T) -> TenancyResult<T> {
    OPERATION_CONTEXT
        .try_with(|context| f(context))
        .map_err(|_| TenancyError::NoActiveContext)
}

/// Check if a context is bound.
#[inline]
pub fn has_context() -> bool {
    OPERATION_CONTEXT.try_with(|_| ()).is_ok()
}
