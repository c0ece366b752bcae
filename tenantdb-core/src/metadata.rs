//! Tenant identity, metadata records and the metadata store seam.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A unique identifier for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a new tenant ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<uuid::Uuid> for TenantId {
    fn from(u: uuid::Uuid) -> Self {
        Self::new(u.to_string())
    }
}

impl From<i64> for TenantId {
    fn from(i: i64) -> Self {
        Self::new(i.to_string())
    }
}

/// How a caller names a tenant: by its stable id or by its URL slug.
///
/// Plain strings convert to [`TenantIdentifier::Slug`], since inbound requests
/// carry the slug (subdomain or path segment).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TenantIdentifier {
    /// Stable tenant id.
    Id(TenantId),
    /// URL slug.
    Slug(String),
}

impl TenantIdentifier {
    /// Identify a tenant by id.
    pub fn id(id: impl Into<TenantId>) -> Self {
        Self::Id(id.into())
    }

    /// Identify a tenant by slug.
    pub fn slug(slug: impl Into<String>) -> Self {
        Self::Slug(slug.into())
    }

    /// The raw identifier value.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Id(id) => id.as_str(),
            Self::Slug(slug) => slug,
        }
    }
}

impl fmt::Display for TenantIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TenantIdentifier {
    fn from(s: &str) -> Self {
        Self::Slug(s.to_string())
    }
}

impl From<String> for TenantIdentifier {
    fn from(s: String) -> Self {
        Self::Slug(s)
    }
}

impl From<TenantId> for TenantIdentifier {
    fn from(id: TenantId) -> Self {
        Self::Id(id)
    }
}

impl From<&TenantId> for TenantIdentifier {
    fn from(id: &TenantId) -> Self {
        Self::Id(id.clone())
    }
}

impl From<&TenantIdentifier> for TenantIdentifier {
    fn from(identifier: &TenantIdentifier) -> Self {
        identifier.clone()
    }
}

/// Lifecycle status of a tenant as recorded by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Serving traffic.
    Active,
    /// Temporarily blocked (billing, abuse review, ...).
    Suspended,
    /// Scheduled for removal; treated as nonexistent.
    PendingDeletion,
}

impl TenantStatus {
    /// The canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::PendingDeletion => "pending_deletion",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tenant status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TenantStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "pending_deletion" | "pending-deletion" => Ok(Self::PendingDeletion),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Identity and routing information for one tenant.
///
/// Snapshots are shared as `Arc<TenantMetadata>` and never mutated; a refresh
/// replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMetadata {
    /// Stable tenant id.
    pub id: TenantId,
    /// URL slug.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Control-plane status.
    pub status: TenantStatus,
    /// Identifier of the tenant's database, handed to the client factory.
    pub database: String,
    /// When a suspended tenant may be reactivated.
    #[serde(default)]
    pub reactivation_deadline: Option<DateTime<Utc>>,
}

impl TenantMetadata {
    /// Create an active tenant record.
    pub fn new(
        id: impl Into<TenantId>,
        slug: impl Into<String>,
        name: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            slug: slug.into(),
            name: name.into(),
            status: TenantStatus::Active,
            database: database.into(),
            reactivation_deadline: None,
        }
    }

    /// Set the status.
    pub fn with_status(mut self, status: TenantStatus) -> Self {
        self.status = status;
        self
    }

    /// Mark as suspended with an optional reactivation deadline.
    pub fn suspended(mut self, reactivation_deadline: Option<DateTime<Utc>>) -> Self {
        self.status = TenantStatus::Suspended;
        self.reactivation_deadline = reactivation_deadline;
        self
    }

    /// Check if the tenant may be served.
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

/// The control plane: source of truth for tenant status and routing.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Look up a tenant by slug.
    async fn lookup_by_slug(&self, slug: &str) -> Result<Option<TenantMetadata>, StoreError>;

    /// Look up a tenant by id.
    async fn lookup_by_id(&self, id: &TenantId) -> Result<Option<TenantMetadata>, StoreError>;

    /// Look up a tenant by either identifier form.
    async fn lookup(
        &self,
        identifier: &TenantIdentifier,
    ) -> Result<Option<TenantMetadata>, StoreError> {
        match identifier {
            TenantIdentifier::Id(id) => self.lookup_by_id(id).await,
            TenantIdentifier::Slug(slug) => self.lookup_by_slug(slug).await,
        }
    }
}

#[async_trait]
impl<S: MetadataStore + ?Sized> MetadataStore for Arc<S> {
    async fn lookup_by_slug(&self, slug: &str) -> Result<Option<TenantMetadata>, StoreError> {
        (**self).lookup_by_slug(slug).await
    }

    async fn lookup_by_id(&self, id: &TenantId) -> Result<Option<TenantMetadata>, StoreError> {
        (**self).lookup_by_id(id).await
    }
}

/// An in-memory metadata store.
///
/// Clones share the same records, so a test or an admin hook can flip a
/// tenant's status while the manager holds another handle.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadataStore {
    tenants: Arc<RwLock<HashMap<TenantId, TenantMetadata>>>,
}

impl StaticMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a tenant.
    pub fn register(&self, metadata: TenantMetadata) -> &Self {
        self.tenants.write().insert(metadata.id.clone(), metadata);
        self
    }

    /// Change the status of a registered tenant. Returns `false` if unknown.
    pub fn set_status(&self, id: &TenantId, status: TenantStatus) -> bool {
        match self.tenants.write().get_mut(id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    /// Remove a tenant.
    pub fn remove(&self, id: &TenantId) -> Option<TenantMetadata> {
        self.tenants.write().remove(id)
    }

    /// Get the number of registered tenants.
    pub fn len(&self) -> usize {
        self.tenants.read().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for StaticMetadataStore {
    async fn lookup_by_slug(&self, slug: &str) -> Result<Option<TenantMetadata>, StoreError> {
        Ok(self
            .tenants
            .read()
            .values()
            .find(|t| t.slug == slug)
            .cloned())
    }

    async fn lookup_by_id(&self, id: &TenantId) -> Result<Option<TenantMetadata>, StoreError> {
        Ok(self.tenants.read().get(id).cloned())
    }
}
