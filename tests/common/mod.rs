//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tenantdb::{ClientError, ClientFactory, StaticMetadataStore, TenantMetadata, TenantStatus};

/// A connection to one tenant database.
#[derive(Debug)]
pub struct FakeConnection {
    pub database: String,
    pub serial: usize,
}

/// Opens [`FakeConnection`]s and records every open and close.
#[derive(Clone, Default)]
pub struct MemoryFactory {
    serial: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<(&'static str, String)>>>,
    connect_delay: Duration,
}

impl MemoryFactory {
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn opened(&self) -> Vec<String> {
        self.events("open")
    }

    pub fn closed(&self) -> Vec<String> {
        self.events("close")
    }

    fn events(&self, kind: &str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, database)| database.clone())
            .collect()
    }
}

#[async_trait]
impl ClientFactory for MemoryFactory {
    type Client = FakeConnection;

    async fn create_client(&self, database: &str) -> Result<FakeConnection, ClientError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if database.starts_with("missing_") {
            return Err(format!("database \"{}\" does not exist", database).into());
        }
        self.log.lock().push(("open", database.to_string()));
        Ok(FakeConnection {
            database: database.to_string(),
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn close_client(&self, client: &FakeConnection) -> Result<(), ClientError> {
        self.log.lock().push(("close", client.database.clone()));
        Ok(())
    }
}

/// A store holding `acme`, `globex` and `umbrella` (active), `initech`
/// (suspended) and `hooli` (active, database missing).
pub fn tenant_store() -> StaticMetadataStore {
    let store = StaticMetadataStore::new();
    store
        .register(TenantMetadata::new("t-acme", "acme", "Acme Corp", "db_acme"))
        .register(TenantMetadata::new("t-globex", "globex", "Globex", "db_globex"))
        .register(TenantMetadata::new("t-umbrella", "umbrella", "Umbrella", "db_umbrella"))
        .register(
            TenantMetadata::new("t-initech", "initech", "Initech", "db_initech")
                .with_status(TenantStatus::Suspended),
        )
        .register(TenantMetadata::new("t-hooli", "hooli", "Hooli", "missing_hooli"));
    store
}
