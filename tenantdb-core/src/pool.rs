//! Per-tenant connection pool cache.
//!
//! [`PoolCache`] owns at most one live client per tenant and hands out
//! reference-counted [`PoolLease`]s:
//!
//! - **Lazy, single-flight construction**: the first acquirer of a tenant
//!   starts construction on a background task; concurrent acquirers join it
//!   and all observe the same client or the same error. Failures are not
//!   cached.
//! - **Capacity bound**: when `max_open_pools` entries exist, the least
//!   recently used unreferenced entry is closed to make room. If none exists
//!   the acquisition fails with [`TenancyError::ResourceExhausted`].
//! - **Idle eviction**: [`PoolCache::sweep_idle`] closes unreferenced entries
//!   idle longer than `idle_timeout`.
//! - **Drain**: after [`PoolCache::begin_shutdown`], [`PoolCache::drain`] waits
//!   for leases to be released and force-closes what remains at the deadline.
//!
//! # Entry states
//!
//! ```text
//! Initializing -> Ready -> Evicting -> Closed   (idle sweep, capacity eviction)
//!                 Ready -> Draining -> Closed   (shutdown)
//! Initializing -> removed                       (construction failed)
//! ```
//!
//! An entry stays in the map until its client has been closed, so a tenant
//! never has two entries at once. Acquirers that find a closing entry wait
//! for it to be gone and then start fresh.
//!
//! # Locking
//!
//! Locks are taken in the order map, entry, idle index and are never held
//! across an await. The idle index holds key `K` for an entry exactly when the
//! entry's `idle_key` is `Some(K)`; both sides change together under the
//! entry's lock.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::ClientFactory;
use crate::config::PoolConfig;
use crate::error::{TenancyError, TenancyResult};
use crate::lifecycle::DrainReport;
use crate::metadata::{TenantId, TenantIdentifier, TenantMetadata};
use crate::registry::TenantRegistry;

type ReadyFuture = Shared<BoxFuture<'static, TenancyResult<()>>>;

/// Externally visible state of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolState {
    /// The client is being constructed.
    Initializing,
    /// The client is open and may be leased.
    Ready,
    /// The client is being closed by the idle sweep or a capacity eviction.
    Evicting,
    /// Shutdown is waiting for leases to be released, or closing the client.
    Draining,
    /// The client has been closed.
    Closed,
}

impl PoolState {
    /// Get the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Evicting => "evicting",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Phase<C> {
    Initializing(ReadyFuture),
    Ready(Arc<C>),
    Evicting,
    /// `None` once the client has been handed to a close task.
    Draining(Option<Arc<C>>),
    Closed,
}

impl<C> Phase<C> {
    fn state(&self) -> PoolState {
        match self {
            Self::Initializing(_) => PoolState::Initializing,
            Self::Ready(_) => PoolState::Ready,
            Self::Evicting => PoolState::Evicting,
            Self::Draining(_) => PoolState::Draining,
            Self::Closed => PoolState::Closed,
        }
    }
}

/// Position in the idle index. Ordered by idle-since time, then insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct IdleKey {
    since: Instant,
    seq: u64,
}

struct EntryState<C> {
    phase: Phase<C>,
    ref_count: usize,
    last_used_at: Instant,
    idle_key: Option<IdleKey>,
}

impl<C> EntryState<C> {
    /// Move the client out for closing, switching to `next`.
    fn take_client(&mut self, next: Phase<C>) -> Option<Arc<C>> {
        match std::mem::replace(&mut self.phase, next) {
            Phase::Ready(client) | Phase::Draining(Some(client)) => Some(client),
            previous => {
                self.phase = previous;
                None
            }
        }
    }

    fn usable_client(&self) -> Option<Arc<C>> {
        match &self.phase {
            Phase::Ready(client) | Phase::Draining(Some(client)) => Some(Arc::clone(client)),
            _ => None,
        }
    }
}

struct PoolEntry<C> {
    tenant_id: TenantId,
    database: String,
    created_at: Instant,
    closed: Notify,
    state: Mutex<EntryState<C>>,
}

impl<C> PoolEntry<C> {
    async fn wait_closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if matches!(self.state.lock().phase, Phase::Closed) {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Idle,
    Capacity,
    Drain,
    Forced,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Capacity => "capacity",
            Self::Drain => "drain",
            Self::Forced => "forced",
        }
    }
}

/// Pool cache statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Entries currently in the cache, in any state.
    pub open_pools: usize,
    /// Entries that are ready and unreferenced.
    pub idle_pools: usize,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Clients constructed.
    pub constructions: u64,
    /// Client constructions that failed or timed out.
    pub construction_failures: u64,
    /// Entries closed by the idle sweep.
    pub idle_evictions: u64,
    /// Entries closed to make room for another tenant.
    pub capacity_evictions: u64,
    /// Entries closed normally during shutdown.
    pub drained: u64,
    /// Entries force-closed at the drain deadline.
    pub forced_closes: u64,
    /// `close_client` calls that failed.
    pub close_failures: u64,
}

#[derive(Default)]
struct AtomicPoolStats {
    acquisitions: AtomicU64,
    constructions: AtomicU64,
    construction_failures: AtomicU64,
    idle_evictions: AtomicU64,
    capacity_evictions: AtomicU64,
    drained: AtomicU64,
    forced_closes: AtomicU64,
    close_failures: AtomicU64,
}

impl AtomicPoolStats {
    #[inline]
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_close(&self, reason: CloseReason) {
        Self::record(match reason {
            CloseReason::Idle => &self.idle_evictions,
            CloseReason::Capacity => &self.capacity_evictions,
            CloseReason::Drain => &self.drained,
            CloseReason::Forced => &self.forced_closes,
        });
    }
}

/// Point-in-time view of one pool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntrySnapshot {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Database identifier the client was opened for.
    pub database: String,
    /// Current state.
    pub state: PoolState,
    /// Leases currently held.
    pub ref_count: usize,
    /// When the last lease was released.
    pub last_used_at: Instant,
    /// When the entry was created.
    pub created_at: Instant,
}

enum Checkout<C> {
    Ready(Arc<PoolEntry<C>>, Arc<C>),
    Pending(Arc<PoolEntry<C>>, ReadyFuture),
    Closing(Arc<PoolEntry<C>>),
    Evict(Arc<PoolEntry<C>>, Arc<C>),
}

/// Cache of per-tenant clients.
///
/// Cheap to clone; clones share the cache.
pub struct PoolCache<F: ClientFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ClientFactory> Clone for PoolCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<F: ClientFactory> {
    factory: F,
    registry: TenantRegistry,
    config: PoolConfig,
    entries: RwLock<HashMap<TenantId, Arc<PoolEntry<F::Client>>>>,
    idle: Mutex<BTreeMap<IdleKey, TenantId>>,
    sequence: AtomicU64,
    shutting_down: AtomicBool,
    /// Signalled when a lease count reaches zero or an entry changes state.
    changed: Notify,
    stats: AtomicPoolStats,
}

impl<F: ClientFactory> PoolCache<F> {
    /// Create an empty cache. Nothing is constructed until the first acquire.
    pub fn new(factory: F, registry: TenantRegistry, config: PoolConfig) -> Self {
        info!(
            max_open_pools = config.max_open_pools,
            idle_timeout = ?config.idle_timeout,
            "Tenant pool cache initialized"
        );
        Self {
            inner: Arc::new(PoolInner {
                factory,
                registry,
                config,
                entries: RwLock::new(HashMap::new()),
                idle: Mutex::new(BTreeMap::new()),
                sequence: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                changed: Notify::new(),
                stats: AtomicPoolStats::default(),
            }),
        }
    }

    /// Lease the client for a tenant, constructing it if needed.
    ///
    /// The lease holds a reference on the entry until it is dropped. If this
    /// future is dropped before it completes, no reference is left behind.
    pub async fn acquire(
        &self,
        identifier: impl Into<TenantIdentifier>,
    ) -> TenancyResult<PoolLease<F>> {
        self.inner.ensure_accepting()?;
        let metadata = self.inner.registry.resolve(identifier).await?;
        let (guard, client) = self.inner.checkout(&metadata).await?;

        AtomicPoolStats::record(&self.inner.stats.acquisitions);
        Ok(PoolLease {
            guard,
            metadata,
            client,
        })
    }

    /// Close every unreferenced entry idle longer than `idle_timeout`.
    /// Returns the number of entries closed.
    pub async fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle().await
    }

    /// Refuse all further acquisitions with [`TenancyError::ShuttingDown`].
    pub fn begin_shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            info!("Tenant pool cache no longer accepting acquisitions");
        }
        self.inner.changed.notify_waiters();
    }

    /// Check if shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Close every entry once its leases are released, force-closing whatever
    /// is still referenced after `timeout`.
    ///
    /// Evictions already in progress are waited on as well, so every client
    /// has been closed when this returns.
    ///
    /// Call [`begin_shutdown`](Self::begin_shutdown) first, otherwise new
    /// entries may appear while draining.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        self.inner.drain(Instant::now() + timeout).await
    }

    /// Number of entries in the cache, in any state.
    pub fn open_pools(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Snapshot every entry, ordered by tenant id.
    pub fn entries(&self) -> Vec<PoolEntrySnapshot> {
        let entries = self.inner.entries.read();
        let mut snapshots: Vec<_> = entries
            .values()
            .map(|entry| {
                let state = entry.state.lock();
                PoolEntrySnapshot {
                    tenant_id: entry.tenant_id.clone(),
                    database: entry.database.clone(),
                    state: state.phase.state(),
                    ref_count: state.ref_count,
                    last_used_at: state.last_used_at,
                    created_at: entry.created_at,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        snapshots
    }

    /// Get a statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        let stats = &self.inner.stats;
        PoolStats {
            open_pools: self.open_pools(),
            idle_pools: self.inner.idle.lock().len(),
            acquisitions: stats.acquisitions.load(Ordering::Relaxed),
            constructions: stats.constructions.load(Ordering::Relaxed),
            construction_failures: stats.construction_failures.load(Ordering::Relaxed),
            idle_evictions: stats.idle_evictions.load(Ordering::Relaxed),
            capacity_evictions: stats.capacity_evictions.load(Ordering::Relaxed),
            drained: stats.drained.load(Ordering::Relaxed),
            forced_closes: stats.forced_closes.load(Ordering::Relaxed),
            close_failures: stats.close_failures.load(Ordering::Relaxed),
        }
    }

    /// Get the registry used to resolve tenants.
    pub fn registry(&self) -> &TenantRegistry {
        &self.inner.registry
    }

    /// Get the client factory.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Get the pool config.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl<F: ClientFactory> std::fmt::Debug for PoolCache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCache")
            .field("config", &self.inner.config)
            .field("open_pools", &self.open_pools())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl<F: ClientFactory> PoolInner<F> {
    fn ensure_accepting(&self) -> TenancyResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(TenancyError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn checkout(
        self: &Arc<Self>,
        metadata: &TenantMetadata,
    ) -> TenancyResult<(RefGuard<F>, Arc<F::Client>)> {
        loop {
            self.ensure_accepting()?;

            match self.try_checkout(metadata)? {
                Checkout::Ready(entry, client) => return Ok((RefGuard::new(self, entry), client)),
                Checkout::Pending(entry, ready) => {
                    // The reference is already counted; the guard gives it
                    // back if construction fails or this future is dropped.
                    let guard = RefGuard::new(self, entry);
                    ready.await?;

                    let client = guard.entry.state.lock().usable_client();
                    if let Some(client) = client {
                        return Ok((guard, client));
                    }
                    // Force-closed between construction and wakeup.
                }
                Checkout::Closing(entry) => entry.wait_closed().await,
                Checkout::Evict(victim, client) => {
                    // Spawned so that cancelling this acquisition cannot
                    // strand the victim in `Evicting`.
                    let closing = self.spawn_close(victim, client, CloseReason::Capacity);
                    await_closes(vec![closing]).await;
                }
            }
        }
    }

    fn try_checkout(
        self: &Arc<Self>,
        metadata: &TenantMetadata,
    ) -> TenancyResult<Checkout<F::Client>> {
        let existing = self.entries.read().get(&metadata.id).cloned();
        if let Some(entry) = existing {
            return Ok(self.join(&entry));
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(&metadata.id).cloned() {
            drop(entries);
            return Ok(self.join(&entry));
        }

        if entries.len() >= self.config.max_open_pools {
            return match self.take_lru_victim(&entries) {
                Some((victim, client)) => {
                    debug!(
                        tenant_id = %victim.tenant_id,
                        for_tenant = %metadata.id,
                        "Evicting least recently used tenant pool"
                    );
                    Ok(Checkout::Evict(victim, client))
                }
                None => {
                    warn!(
                        tenant_id = %metadata.id,
                        max_open_pools = self.config.max_open_pools,
                        "Tenant pool capacity exhausted"
                    );
                    Err(TenancyError::resource_exhausted(self.config.max_open_pools))
                }
            };
        }

        let (tx, rx) = oneshot::channel();
        let (entry, ready) = self.new_entry(metadata, rx);
        entries.insert(metadata.id.clone(), Arc::clone(&entry));
        drop(entries);

        debug!(tenant_id = %metadata.id, database = %metadata.database, "Constructing tenant pool");
        let inner = Arc::clone(self);
        let constructing = Arc::clone(&entry);
        tokio::spawn(async move {
            let result = inner.construct(&constructing).await;
            let _ = tx.send(result);
        });

        Ok(Checkout::Pending(entry, ready))
    }

    /// Build an `Initializing` entry holding one reference for its creator.
    fn new_entry(
        self: &Arc<Self>,
        metadata: &TenantMetadata,
        rx: oneshot::Receiver<TenancyResult<()>>,
    ) -> (Arc<PoolEntry<F::Client>>, ReadyFuture) {
        let mut ready_out = None;
        let now = Instant::now();

        let entry = Arc::new_cyclic(|weak_entry: &Weak<PoolEntry<F::Client>>| {
            let weak_entry = weak_entry.clone();
            let weak_inner = Arc::downgrade(self);
            let ready = async move {
                match rx.await {
                    Ok(result) => result,
                    Err(_) => {
                        if let (Some(inner), Some(entry)) =
                            (weak_inner.upgrade(), weak_entry.upgrade())
                        {
                            inner.finalize(&entry);
                        }
                        Err(TenancyError::internal(
                            "tenant pool construction ended without a result",
                        ))
                    }
                }
            }
            .boxed()
            .shared();
            ready_out = Some(ready.clone());

            PoolEntry {
                tenant_id: metadata.id.clone(),
                database: metadata.database.clone(),
                created_at: now,
                closed: Notify::new(),
                state: Mutex::new(EntryState {
                    phase: Phase::Initializing(ready),
                    ref_count: 1,
                    last_used_at: now,
                    idle_key: None,
                }),
            }
        });

        // new_cyclic always runs the closure.
        let ready = match ready_out {
            Some(ready) => ready,
            None => futures::future::ready(Err(TenancyError::internal("entry not initialized")))
                .boxed()
                .shared(),
        };
        (entry, ready)
    }

    fn join(&self, entry: &Arc<PoolEntry<F::Client>>) -> Checkout<F::Client> {
        let mut state = entry.state.lock();
        match &state.phase {
            Phase::Ready(client) => {
                let client = Arc::clone(client);
                state.ref_count += 1;
                self.unmark_idle(&mut state);
                Checkout::Ready(Arc::clone(entry), client)
            }
            Phase::Initializing(ready) => {
                let ready = ready.clone();
                state.ref_count += 1;
                Checkout::Pending(Arc::clone(entry), ready)
            }
            Phase::Evicting | Phase::Draining(_) | Phase::Closed => {
                Checkout::Closing(Arc::clone(entry))
            }
        }
    }

    async fn construct(self: &Arc<Self>, entry: &Arc<PoolEntry<F::Client>>) -> TenancyResult<()> {
        let timeout = self.config.connect_timeout;
        let created =
            match tokio::time::timeout(timeout, self.factory.create_client(&entry.database)).await
            {
                Ok(Ok(client)) => Ok(Arc::new(client)),
                Ok(Err(e)) => Err(TenancyError::connection(&entry.tenant_id, e)),
                Err(_) => Err(TenancyError::connection(
                    &entry.tenant_id,
                    format!("pool construction timed out after {:?}", timeout),
                )),
            };

        let client = match created {
            Ok(client) => client,
            Err(e) => {
                AtomicPoolStats::record(&self.stats.construction_failures);
                warn!(tenant_id = %entry.tenant_id, error = %e, "Tenant pool construction failed");
                self.finalize(entry);
                return Err(e);
            }
        };

        let abandoned = {
            let mut state = entry.state.lock();
            if matches!(state.phase, Phase::Initializing(_)) {
                state.phase = Phase::Ready(Arc::clone(&client));
                if state.ref_count == 0 {
                    self.mark_idle(entry, &mut state);
                }
                false
            } else {
                true
            }
        };

        if abandoned {
            // Force-closed by a drain while the factory was still working.
            if let Err(e) = self.factory.close_client(&client).await {
                AtomicPoolStats::record(&self.stats.close_failures);
                warn!(tenant_id = %entry.tenant_id, error = %e, "Failed to close abandoned tenant pool");
            }
            return Err(TenancyError::ShuttingDown);
        }

        AtomicPoolStats::record(&self.stats.constructions);
        debug!(tenant_id = %entry.tenant_id, "Tenant pool ready");
        self.changed.notify_waiters();
        Ok(())
    }

    fn release(&self, entry: &PoolEntry<F::Client>) {
        let mut state = entry.state.lock();
        state.ref_count = state.ref_count.saturating_sub(1);
        state.last_used_at = Instant::now();

        if state.ref_count == 0 {
            if matches!(state.phase, Phase::Ready(_)) {
                self.mark_idle(entry, &mut state);
            }
            drop(state);
            self.changed.notify_waiters();
        }
    }

    fn mark_idle(&self, entry: &PoolEntry<F::Client>, state: &mut EntryState<F::Client>) {
        self.unmark_idle(state);
        let key = IdleKey {
            since: state.last_used_at,
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        state.idle_key = Some(key);
        self.idle.lock().insert(key, entry.tenant_id.clone());
    }

    fn unmark_idle(&self, state: &mut EntryState<F::Client>) {
        if let Some(key) = state.idle_key.take() {
            self.idle.lock().remove(&key);
        }
    }

    /// Pick the least recently used idle entry and mark it `Evicting`.
    ///
    /// Called with the map write lock held.
    fn take_lru_victim(
        &self,
        entries: &HashMap<TenantId, Arc<PoolEntry<F::Client>>>,
    ) -> Option<(Arc<PoolEntry<F::Client>>, Arc<F::Client>)> {
        loop {
            let (key, tenant_id) = {
                let idle = self.idle.lock();
                let (key, tenant_id) = idle.first_key_value()?;
                (*key, tenant_id.clone())
            };

            let Some(entry) = entries.get(&tenant_id) else {
                self.idle.lock().remove(&key);
                continue;
            };

            let mut state = entry.state.lock();
            if state.idle_key != Some(key) {
                // Re-used since we peeked; the key is stale if still present.
                self.idle.lock().remove(&key);
                continue;
            }
            if state.ref_count == 0 {
                if let Some(client) = state.take_client(Phase::Evicting) {
                    self.unmark_idle(&mut state);
                    return Some((Arc::clone(entry), client));
                }
            }
            self.unmark_idle(&mut state);
        }
    }

    async fn sweep_idle(self: &Arc<Self>) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.config.idle_timeout) else {
            return 0;
        };

        let candidates: Vec<(IdleKey, TenantId)> = self
            .idle
            .lock()
            .range(..IdleKey {
                since: cutoff,
                seq: 0,
            })
            .map(|(key, tenant_id)| (*key, tenant_id.clone()))
            .collect();

        if candidates.is_empty() {
            return 0;
        }

        let mut closing = Vec::with_capacity(candidates.len());
        {
            let entries = self.entries.read();
            for (key, tenant_id) in candidates {
                let Some(entry) = entries.get(&tenant_id) else {
                    continue;
                };
                let mut state = entry.state.lock();
                // Re-check: a racing acquirer may have just picked it up.
                if state.idle_key != Some(key) || state.ref_count > 0 {
                    continue;
                }
                if let Some(client) = state.take_client(Phase::Evicting) {
                    self.unmark_idle(&mut state);
                    closing.push(self.spawn_close(Arc::clone(entry), client, CloseReason::Idle));
                }
            }
        }

        let evicted = closing.len();
        await_closes(closing).await;
        if evicted > 0 {
            info!(evicted, "Idle tenant pools closed");
        }
        evicted
    }

    async fn drain(self: &Arc<Self>, deadline: Instant) -> DrainReport {
        let started = Instant::now();
        let mut report = DrainReport::default();
        let mut closing = Vec::new();

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut pending = 0;
            {
                let entries = self.entries.read();
                for entry in entries.values() {
                    let mut state = entry.state.lock();
                    match (state.phase.state(), state.ref_count) {
                        (PoolState::Initializing, _) => pending += 1,
                        (PoolState::Ready | PoolState::Draining, 0) => {
                            if let Some(client) = state.take_client(Phase::Draining(None)) {
                                self.unmark_idle(&mut state);
                                closing.push(self.spawn_close(
                                    Arc::clone(entry),
                                    client,
                                    CloseReason::Drain,
                                ));
                                report.closed += 1;
                            }
                        }
                        (PoolState::Ready, _) => {
                            if let Some(client) = state.usable_client() {
                                state.phase = Phase::Draining(Some(client));
                            }
                            pending += 1;
                        }
                        // Closed by a sweep or capacity eviction that is still running.
                        (PoolState::Draining | PoolState::Evicting, _) => pending += 1,
                        (PoolState::Closed, _) => {}
                    }
                }
            }

            if pending == 0 {
                break;
            }

            debug!(pending, "Waiting for tenant pools to drain");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                report.forced = self.force_close(&mut closing);
                break;
            }
        }

        await_closes(closing).await;
        report.elapsed = started.elapsed();
        report
    }

    /// Close everything still open at the drain deadline.
    fn force_close(self: &Arc<Self>, closing: &mut Vec<JoinHandle<()>>) -> usize {
        let mut forced = 0;
        let mut abandoned = Vec::new();
        {
            let entries = self.entries.read();
            for entry in entries.values() {
                let mut state = entry.state.lock();
                match state.phase.state() {
                    PoolState::Initializing => {
                        warn!(
                            tenant_id = %entry.tenant_id,
                            ref_count = state.ref_count,
                            "Drain timeout: abandoning tenant pool under construction"
                        );
                        state.phase = Phase::Closed;
                        abandoned.push(Arc::clone(entry));
                        forced += 1;
                    }
                    PoolState::Ready | PoolState::Draining => {
                        let ref_count = state.ref_count;
                        if let Some(client) = state.take_client(Phase::Draining(None)) {
                            self.unmark_idle(&mut state);
                            warn!(
                                tenant_id = %entry.tenant_id,
                                ref_count,
                                "Drain timeout: force-closing tenant pool"
                            );
                            closing.push(self.spawn_close(
                                Arc::clone(entry),
                                client,
                                CloseReason::Forced,
                            ));
                            forced += 1;
                        }
                    }
                    PoolState::Evicting | PoolState::Closed => {}
                }
            }
        }

        for entry in abandoned {
            AtomicPoolStats::record(&self.stats.forced_closes);
            self.finalize(&entry);
        }
        forced
    }

    fn spawn_close(
        self: &Arc<Self>,
        entry: Arc<PoolEntry<F::Client>>,
        client: Arc<F::Client>,
        reason: CloseReason,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let failure = match AssertUnwindSafe(inner.factory.close_client(&client))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("close_client panicked".to_string()),
            };
            if let Some(error) = failure {
                AtomicPoolStats::record(&inner.stats.close_failures);
                warn!(
                    tenant_id = %entry.tenant_id,
                    reason = reason.as_str(),
                    error = %error,
                    "Failed to close tenant pool; discarding it"
                );
            }
            inner.finalize(&entry);
            inner.stats.record_close(reason);
            debug!(tenant_id = %entry.tenant_id, reason = reason.as_str(), "Tenant pool closed");
        })
    }

    /// Remove the entry from the map and mark it closed.
    fn finalize(&self, entry: &Arc<PoolEntry<F::Client>>) {
        {
            let mut entries = self.entries.write();
            if entries
                .get(&entry.tenant_id)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                entries.remove(&entry.tenant_id);
            }
            let mut state = entry.state.lock();
            state.phase = Phase::Closed;
            self.unmark_idle(&mut state);
        }
        entry.closed.notify_waiters();
        self.changed.notify_waiters();
    }
}

/// Wait for close tasks. They finalize their entry even if the factory
/// panics, so a join error here means the runtime cancelled the task.
async fn await_closes(closing: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(closing).await {
        if let Err(e) = result {
            warn!(error = %e, "Tenant pool close task did not complete");
        }
    }
}

/// Gives an entry reference back on drop.
struct RefGuard<F: ClientFactory> {
    inner: Arc<PoolInner<F>>,
    entry: Arc<PoolEntry<F::Client>>,
}

impl<F: ClientFactory> RefGuard<F> {
    fn new(inner: &Arc<PoolInner<F>>, entry: Arc<PoolEntry<F::Client>>) -> Self {
        Self {
            inner: Arc::clone(inner),
            entry,
        }
    }
}

impl<F: ClientFactory> Drop for RefGuard<F> {
    fn drop(&mut self) {
        self.inner.release(&self.entry);
    }
}

/// A counted reference to a tenant's client.
///
/// The entry cannot be evicted while the lease is alive. Dropping the lease
/// releases it.
pub struct PoolLease<F: ClientFactory> {
    guard: RefGuard<F>,
    metadata: Arc<TenantMetadata>,
    client: Arc<F::Client>,
}

impl<F: ClientFactory> PoolLease<F> {
    /// The leased tenant's id.
    pub fn tenant_id(&self) -> &TenantId {
        &self.metadata.id
    }

    /// The metadata the lease was resolved with.
    pub fn metadata(&self) -> &Arc<TenantMetadata> {
        &self.metadata
    }

    /// The tenant's client.
    pub fn client(&self) -> &F::Client {
        &self.client
    }

    /// A shared handle to the tenant's client.
    pub fn client_arc(&self) -> Arc<F::Client> {
        Arc::clone(&self.client)
    }

    /// Release the lease. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }
}

impl<F: ClientFactory> std::fmt::Debug for PoolLease<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("tenant_id", &self.metadata.id)
            .field("database", &self.guard.entry.database)
            .finish()
    }
}
