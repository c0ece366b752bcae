//! Instrumented fakes shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::ClientFactory;
use crate::error::{ClientError, StoreError};
use crate::metadata::{MetadataStore, StaticMetadataStore, TenantId, TenantMetadata, TenantStatus};

/// A [`StaticMetadataStore`] that counts lookups and can be slowed or broken.
#[derive(Clone, Default)]
pub struct CountingStore {
    records: StaticMetadataStore,
    lookups: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    delay: Duration,
}

impl CountingStore {
    pub fn with_tenant(metadata: TenantMetadata) -> Self {
        let store = Self::default();
        store.register(metadata);
        store
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn register(&self, metadata: TenantMetadata) {
        self.records.register(metadata);
    }

    pub fn set_status(&self, id: &TenantId, status: TenantStatus) {
        self.records.set_status(id, status);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err("control plane unreachable".into());
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for CountingStore {
    async fn lookup_by_slug(&self, slug: &str) -> Result<Option<TenantMetadata>, StoreError> {
        self.enter().await?;
        self.records.lookup_by_slug(slug).await
    }

    async fn lookup_by_id(&self, id: &TenantId) -> Result<Option<TenantMetadata>, StoreError> {
        self.enter().await?;
        self.records.lookup_by_id(id).await
    }
}

/// A client handed out by [`CountingFactory`].
#[derive(Debug)]
pub struct TestClient {
    pub database: String,
    pub serial: usize,
}

/// A client factory that counts opens and closes.
#[derive(Clone, Default)]
pub struct CountingFactory {
    created: Arc<AtomicUsize>,
    closed: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
    failing_close: Arc<AtomicBool>,
    panicking_close: Arc<AtomicBool>,
    delay: Duration,
    close_delay: Duration,
}

impl CountingFactory {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn panic_on_close(&self, panicking: bool) {
        self.panicking_close.store(panicking, Ordering::SeqCst);
    }

    pub fn fail_close(&self, failing: bool) {
        self.failing_close.store(failing, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Databases whose clients were closed, in close order.
    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl ClientFactory for CountingFactory {
    type Client = TestClient;

    async fn create_client(&self, database: &str) -> Result<TestClient, ClientError> {
        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(format!("connection refused: {}", database).into());
        }
        Ok(TestClient {
            database: database.to_string(),
            serial,
        })
    }

    async fn close_client(&self, client: &TestClient) -> Result<(), ClientError> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closed.lock().push(client.database.clone());
        if self.panicking_close.load(Ordering::SeqCst) {
            panic!("driver bug while closing {}", client.database);
        }
        if self.failing_close.load(Ordering::SeqCst) {
            return Err("close failed".into());
        }
        Ok(())
    }
}

/// A store with tenants `alpha`, `beta`, `gamma` and `delta`.
pub fn four_tenants() -> CountingStore {
    let store = CountingStore::default();
    for name in ["alpha", "beta", "gamma", "delta"] {
        store.register(TenantMetadata::new(
            format!("t-{}", name),
            name,
            name,
            format!("db_{}", name),
        ));
    }
    store
}
