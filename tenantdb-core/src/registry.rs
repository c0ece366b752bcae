//! Tenant metadata registry.
//!
//! [`TenantRegistry`] sits in front of a [`MetadataStore`] and provides:
//!
//! - **TTL caching** keyed by both slug and id, so a tenant resolved by one
//!   form is a hit for the other
//! - **Single-flight lookups**: concurrent misses for the same identifier
//!   share one store call
//! - **Negative caching** of unknown tenants (disabled by default)
//! - **Status classification** into [`TenancyError::TenantSuspended`] and
//!   [`TenancyError::TenantNotFound`]
//!
//! Cached snapshots are `Arc<TenantMetadata>` and are replaced wholesale when
//! they expire. Within the TTL a resolve may observe a stale status.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tenantdb_core::{RegistryConfig, StaticMetadataStore, TenantMetadata, TenantRegistry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tenantdb_core::TenancyResult<()> {
//! let store = StaticMetadataStore::new();
//! store.register(TenantMetadata::new("t-1", "acme", "Acme Corp", "db_acme"));
//!
//! let registry = TenantRegistry::new(store, RegistryConfig::default());
//! let acme = registry.resolve("acme").await?;
//! assert_eq!(acme.database, "db_acme");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::error::{TenancyError, TenancyResult};
use crate::metadata::{MetadataStore, TenantId, TenantIdentifier, TenantMetadata, TenantStatus};

type Lookup = TenancyResult<Option<Arc<TenantMetadata>>>;
type LookupFuture = Shared<BoxFuture<'static, Lookup>>;

/// A cached lookup result. `metadata == None` is a negative entry.
#[derive(Debug, Clone)]
struct CacheEntry {
    metadata: Option<Arc<TenantMetadata>>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Registry metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryMetrics {
    /// Resolves answered from a live positive entry.
    pub hits: u64,
    /// Resolves answered from a live negative entry.
    pub negative_hits: u64,
    /// Resolves that found no live entry.
    pub misses: u64,
    /// Misses caused by an expired entry.
    pub expirations: u64,
    /// Store calls issued.
    pub lookups: u64,
    /// Misses that joined a lookup already in flight.
    pub coalesced: u64,
    /// Store calls that failed or timed out.
    pub lookup_failures: u64,
    /// Cache entries currently held (each tenant occupies a slug and an id key).
    pub size: usize,
}

impl RegistryMetrics {
    /// Fraction of resolves answered from cache.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.negative_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicRegistryMetrics {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    lookups: AtomicU64,
    coalesced: AtomicU64,
    lookup_failures: AtomicU64,
}

impl AtomicRegistryMetrics {
    #[inline]
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, size: usize) -> RegistryMetrics {
        RegistryMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            size,
        }
    }
}

/// Caching, single-flight front for a [`MetadataStore`].
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct TenantRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<dyn MetadataStore>,
    config: RegistryConfig,
    entries: RwLock<HashMap<TenantIdentifier, CacheEntry>>,
    /// Locked before `entries` whenever both are needed.
    in_flight: Mutex<InFlight>,
    /// Orders lookup starts against invalidations.
    sequence: AtomicU64,
    metrics: AtomicRegistryMetrics,
}

/// Lookups in progress and the invalidations they must respect.
#[derive(Default)]
struct InFlight {
    lookups: HashMap<TenantIdentifier, (u64, LookupFuture)>,
    /// Sequence number of each tenant's latest invalidation. Only lookups
    /// started before it are affected, so it is emptied when none are left.
    invalidated: HashMap<TenantId, u64>,
    /// Sequence number of the latest [`TenantRegistry::clear`].
    cleared_at: u64,
}

impl InFlight {
    /// Check if a result from a lookup started at `started` is outdated.
    fn is_stale(
        &self,
        started: u64,
        identifier: &TenantIdentifier,
        found: Option<&Arc<TenantMetadata>>,
    ) -> bool {
        if self.cleared_at > started {
            return true;
        }

        let tenant_id = match (found, identifier) {
            (Some(metadata), _) => Some(&metadata.id),
            (None, TenantIdentifier::Id(id)) => Some(id),
            (None, TenantIdentifier::Slug(_)) => None,
        };
        tenant_id
            .and_then(|id| self.invalidated.get(id))
            .is_some_and(|mark| *mark > started)
    }
}

impl TenantRegistry {
    /// Create a registry over the given store.
    pub fn new(store: impl MetadataStore + 'static, config: RegistryConfig) -> Self {
        Self::from_arc(Arc::new(store), config)
    }

    /// Create a registry over a shared store.
    pub fn from_arc(store: Arc<dyn MetadataStore>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                config,
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(InFlight::default()),
                sequence: AtomicU64::new(1),
                metrics: AtomicRegistryMetrics::default(),
            }),
        }
    }

    /// Get the registry config.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Resolve a tenant to its metadata.
    ///
    /// Fails with [`TenancyError::TenantSuspended`] for suspended tenants,
    /// [`TenancyError::TenantNotFound`] for unknown or pending-deletion
    /// tenants, and [`TenancyError::MetadataUnavailable`] when the store fails.
    pub async fn resolve(
        &self,
        identifier: impl Into<TenantIdentifier>,
    ) -> TenancyResult<Arc<TenantMetadata>> {
        let identifier = identifier.into();
        let found = match self.inner.cached(&identifier) {
            Some(found) => found,
            None => self.fetch(&identifier).await?,
        };
        classify(&identifier, found)
    }

    /// Drop every cached entry for a tenant so the next resolve hits the store.
    ///
    /// Lookups for this tenant already in flight still answer their waiters
    /// but do not repopulate the cache. Other tenants are unaffected.
    pub fn invalidate(&self, tenant_id: &TenantId) {
        let mut in_flight = self.inner.in_flight.lock();
        let mut entries = self.inner.entries.write();

        let mark = self.inner.sequence.fetch_add(1, Ordering::AcqRel);
        if !in_flight.lookups.is_empty() {
            in_flight.invalidated.insert(tenant_id.clone(), mark);
        }

        let mut retired = vec![TenantIdentifier::Id(tenant_id.clone())];
        entries.retain(|key, entry| {
            let by_id = matches!(key, TenantIdentifier::Id(id) if id == tenant_id);
            let same_tenant = entry
                .metadata
                .as_ref()
                .is_some_and(|m| &m.id == tenant_id);
            if same_tenant {
                retired.push(key.clone());
            }
            !(by_id || same_tenant)
        });

        // Later resolves of this tenant start a fresh lookup instead of
        // joining one that began before the invalidation.
        for key in &retired {
            in_flight.lookups.remove(key);
        }
        debug!(tenant_id = %tenant_id, "Tenant metadata invalidated");
    }

    /// Remove expired entries. Returns the number removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Drop the whole cache.
    pub fn clear(&self) {
        let mut in_flight = self.inner.in_flight.lock();
        let mut entries = self.inner.entries.write();
        in_flight.cleared_at = self.inner.sequence.fetch_add(1, Ordering::AcqRel);
        in_flight.lookups.clear();
        entries.clear();
    }

    /// Number of cache entries, live or expired.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a metrics snapshot.
    pub fn metrics(&self) -> RegistryMetrics {
        self.inner.metrics.snapshot(self.len())
    }

    /// Join the in-flight lookup for `identifier`, or start one.
    async fn fetch(&self, identifier: &TenantIdentifier) -> Lookup {
        let lookup = {
            let mut in_flight = self.inner.in_flight.lock();

            match in_flight.lookups.get(identifier) {
                Some((_, lookup)) => {
                    AtomicRegistryMetrics::record(&self.inner.metrics.coalesced);
                    lookup.clone()
                }
                None => {
                    // A lookup may have finished between the cache check and
                    // taking the in-flight lock.
                    if let Some(found) = self.inner.peek(identifier) {
                        return Ok(found);
                    }

                    let started = self.inner.sequence.fetch_add(1, Ordering::AcqRel);
                    let lookup = Arc::clone(&self.inner)
                        .lookup(identifier.clone(), started)
                        .boxed()
                        .shared();
                    in_flight
                        .lookups
                        .insert(identifier.clone(), (started, lookup.clone()));
                    lookup
                }
            }
        };

        lookup.await
    }
}

impl RegistryInner {
    /// Cache check that records metrics. `Some(None)` is a negative hit.
    fn cached(&self, identifier: &TenantIdentifier) -> Option<Option<Arc<TenantMetadata>>> {
        let entries = self.entries.read();
        match entries.get(identifier) {
            Some(entry) if !entry.is_expired(Instant::now()) => {
                if entry.metadata.is_some() {
                    AtomicRegistryMetrics::record(&self.metrics.hits);
                } else {
                    AtomicRegistryMetrics::record(&self.metrics.negative_hits);
                }
                Some(entry.metadata.clone())
            }
            Some(_) => {
                AtomicRegistryMetrics::record(&self.metrics.expirations);
                AtomicRegistryMetrics::record(&self.metrics.misses);
                None
            }
            None => {
                AtomicRegistryMetrics::record(&self.metrics.misses);
                None
            }
        }
    }

    fn peek(&self, identifier: &TenantIdentifier) -> Option<Option<Arc<TenantMetadata>>> {
        let entries = self.entries.read();
        entries
            .get(identifier)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.metadata.clone())
    }

    async fn lookup(self: Arc<Self>, identifier: TenantIdentifier, started: u64) -> Lookup {
        AtomicRegistryMetrics::record(&self.metrics.lookups);
        debug!(identifier = %identifier, "Looking up tenant metadata");

        let timeout = self.config.lookup_timeout;
        let result = match tokio::time::timeout(timeout, self.store.lookup(&identifier)).await {
            Ok(Ok(found)) => Ok(found.map(Arc::new)),
            Ok(Err(e)) => Err(TenancyError::metadata_unavailable(&identifier, e)),
            Err(_) => Err(TenancyError::metadata_unavailable(
                &identifier,
                format!("lookup timed out after {:?}", timeout),
            )),
        };

        let mut in_flight = self.in_flight.lock();
        match &result {
            Ok(found) => {
                if in_flight.is_stale(started, &identifier, found.as_ref()) {
                    debug!(identifier = %identifier, "Invalidated during lookup; not cached");
                } else {
                    self.store_result(&identifier, found.as_ref());
                }
            }
            Err(e) => {
                AtomicRegistryMetrics::record(&self.metrics.lookup_failures);
                warn!(identifier = %identifier, error = %e, "Tenant metadata lookup failed");
            }
        }

        if matches!(in_flight.lookups.get(&identifier), Some((seq, _)) if *seq == started) {
            in_flight.lookups.remove(&identifier);
        }
        if in_flight.lookups.is_empty() {
            in_flight.invalidated.clear();
        }

        result
    }

    /// Called with the in-flight lock held.
    fn store_result(&self, identifier: &TenantIdentifier, found: Option<&Arc<TenantMetadata>>) {
        let mut entries = self.entries.write();

        let now = Instant::now();
        match found {
            Some(metadata) if !self.config.ttl.is_zero() => {
                let entry = CacheEntry {
                    metadata: Some(Arc::clone(metadata)),
                    expires_at: now + self.config.ttl,
                };
                entries.insert(TenantIdentifier::Id(metadata.id.clone()), entry.clone());
                entries.insert(TenantIdentifier::Slug(metadata.slug.clone()), entry);
            }
            None if !self.config.negative_ttl.is_zero() => {
                entries.insert(
                    identifier.clone(),
                    CacheEntry {
                        metadata: None,
                        expires_at: now + self.config.negative_ttl,
                    },
                );
            }
            _ => {}
        }
    }
}

fn classify(
    identifier: &TenantIdentifier,
    found: Option<Arc<TenantMetadata>>,
) -> TenancyResult<Arc<TenantMetadata>> {
    let Some(metadata) = found else {
        return Err(TenancyError::not_found(identifier));
    };

    match metadata.status {
        TenantStatus::Active => Ok(metadata),
        TenantStatus::Suspended => Err(TenancyError::suspended(
            metadata.id.clone(),
            metadata.reactivation_deadline,
        )),
        TenantStatus::PendingDeletion => Err(TenancyError::not_found(identifier)),
    }
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .finish()
    }
}
