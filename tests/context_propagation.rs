//! Integration tests for the task-local operation context.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeConnection, MemoryFactory, tenant_store};
use pretty_assertions::assert_eq;
use tenantdb::context;
use tenantdb::{RequestMeta, TenancyError, TenantConnectionManager, TenantId, TenantStatus};

fn manager(factory: &MemoryFactory) -> Arc<TenantConnectionManager<MemoryFactory>> {
    Arc::new(
        TenantConnectionManager::builder()
            .store(tenant_store())
            .factory(factory.clone())
            .build()
            .expect("valid manager"),
    )
}

/// Repository code several calls deep reads the context without parameters.
async fn load_orders() -> Result<String, TenancyError> {
    tokio::task::yield_now().await;
    order_repository().await
}

async fn order_repository() -> Result<String, TenancyError> {
    let ctx = context::current()?;
    let connection = ctx
        .client::<FakeConnection>()
        .ok_or_else(|| TenancyError::internal("unexpected client type"))?;
    Ok(format!("{}@{}", ctx.tenant_slug(), connection.database))
}

#[tokio::test]
async fn test_bound_context_reaches_nested_calls() {
    let factory = MemoryFactory::default();
    let manager = manager(&factory);

    let request = RequestMeta::new()
        .with_request_id("req-7")
        .with_user_id("u-1")
        .with_roles(["admin", "billing"]);

    let (location, request_id, is_admin, status) = manager
        .bind("acme", request, async {
            let location = load_orders().await.unwrap();
            let ctx = context::current().unwrap();
            (
                location,
                ctx.request_id().map(String::from),
                ctx.has_role("admin"),
                ctx.tenant_status(),
            )
        })
        .await
        .unwrap();

    assert_eq!(location, "acme@db_acme");
    assert_eq!(request_id.as_deref(), Some("req-7"));
    assert!(is_admin);
    assert_eq!(status, TenantStatus::Active);
    assert!(!context::has_context());
}

#[tokio::test]
async fn test_no_context_outside_bind() {
    assert_eq!(load_orders().await.unwrap_err(), TenancyError::NoActiveContext);
    assert!(context::try_current().is_none());
}

/// Concurrent operations for different tenants never observe each other.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tenants_are_isolated() {
    let factory = MemoryFactory::default();
    let manager = manager(&factory);

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let tenant = if i % 2 == 0 { "acme" } else { "globex" };
            tokio::spawn(async move {
                manager
                    .bind(tenant, RequestMeta::new(), async move {
                        for _ in 0..5 {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            let seen = context::with_current(|ctx| ctx.tenant_slug().to_string())
                                .unwrap();
                            assert_eq!(seen, tenant);
                        }
                        load_orders().await.unwrap()
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let expected = if i % 2 == 0 { "acme@db_acme" } else { "globex@db_globex" };
        assert_eq!(task.await.unwrap(), expected);
    }
    assert_eq!(factory.opened().len(), 2);
}

/// An inner bind shadows the outer context only for its own extent.
#[tokio::test]
async fn test_nested_bind_restores_outer() {
    let factory = MemoryFactory::default();
    let manager = manager(&factory);

    let inner_manager = Arc::clone(&manager);
    let seen = manager
        .bind("acme", RequestMeta::new(), async move {
            let inner = inner_manager
                .bind("globex", RequestMeta::new(), load_orders())
                .await
                .unwrap()
                .unwrap();
            let outer = load_orders().await.unwrap();
            (inner, outer)
        })
        .await
        .unwrap();

    assert_eq!(seen, ("globex@db_globex".to_string(), "acme@db_acme".to_string()));
}

/// Spawned work inherits the context only when it is passed explicitly.
#[tokio::test]
async fn test_spawned_task_with_explicit_scope() {
    let factory = MemoryFactory::default();
    let manager = manager(&factory);

    let (detached, scoped) = manager
        .bind("globex", RequestMeta::new(), async {
            let detached = tokio::spawn(async { context::has_context() }).await.unwrap();

            let ctx = context::current().unwrap();
            let scoped = tokio::spawn(context::scope(ctx, load_orders()))
                .await
                .unwrap()
                .unwrap();
            (detached, scoped)
        })
        .await
        .unwrap();

    assert!(!detached);
    assert_eq!(scoped, "globex@db_globex");
}

/// Resolution failures surface before the operation is polled.
#[tokio::test]
async fn test_rejected_tenants_never_run() {
    let factory = MemoryFactory::default();
    let manager = manager(&factory);
    let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    let err = manager
        .bind("initech", RequestMeta::new(), async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .await
        .unwrap_err();
    assert!(err.is_suspended());
    assert_eq!(
        err,
        TenancyError::suspended(TenantId::new("t-initech"), None)
    );

    let flag = Arc::clone(&ran);
    let err = manager
        .bind("wayne", RequestMeta::new(), async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    assert!(factory.opened().is_empty());
}

/// The lease is returned even when the operation panics.
#[tokio::test]
async fn test_lease_released_after_panic() {
    let factory = MemoryFactory::default();
    let manager = manager(&factory);

    let task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .bind("acme", RequestMeta::new(), async {
                    panic!("handler bug");
                })
                .await
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    let entries = manager.pools().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].ref_count, 0);
}
