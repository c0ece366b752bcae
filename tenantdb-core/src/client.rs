//! The client factory seam.
//!
//! The pool cache never talks to a database driver directly. It asks a
//! [`ClientFactory`] to open a client for a tenant's database and to close it
//! again when the pool entry is evicted or drained. A "client" is whatever the
//! driver calls its pooled handle; for PostgreSQL that is a `deadpool_postgres::Pool`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ClientError;

/// Opens and closes per-tenant database clients.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// The pooled client handle owned by one pool entry.
    type Client: Send + Sync + 'static;

    /// Open a client for the given database identifier.
    async fn create_client(&self, database: &str) -> Result<Self::Client, ClientError>;

    /// Close a client. Best-effort; failures are logged and the client is
    /// discarded anyway.
    async fn close_client(&self, client: &Self::Client) -> Result<(), ClientError>;
}

#[async_trait]
impl<F: ClientFactory> ClientFactory for Arc<F> {
    type Client = F::Client;

    async fn create_client(&self, database: &str) -> Result<Self::Client, ClientError> {
        (**self).create_client(database).await
    }

    async fn close_client(&self, client: &Self::Client) -> Result<(), ClientError> {
        (**self).close_client(client).await
    }
}
