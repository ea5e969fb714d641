//! Concurrency tests for the regional client router

mod common;

use cloudrecon::{RegionalClientRouter, Scope};
use common::ScriptedFactory;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_resolution_builds_one_client() {
    // Slow enough that every task arrives while the first connect is in flight
    let factory = ScriptedFactory::new().with_connect_delay(Duration::from_millis(50));
    let router = Arc::new(RegionalClientRouter::new(factory));
    let scope = Scope::region("ap-guangzhou");

    let tasks = (0..32).map(|_| {
        let router = Arc::clone(&router);
        let scope = scope.clone();
        tokio::spawn(async move { router.resolve(&scope).await.is_ok() })
    });
    let results = join_all(tasks).await;

    assert!(results.into_iter().all(|r| r.unwrap()));
    assert_eq!(router.factory().connects(), 1);
    assert_eq!(router.cached_scopes().await, vec![scope]);
}

#[tokio::test]
async fn test_each_scope_is_built_once() {
    let router = RegionalClientRouter::new(ScriptedFactory::new());
    let scopes = vec![
        Scope::region("ap-guangzhou"),
        Scope::region("ap-shanghai"),
        Scope::region("ap-shanghai").with_account("100002"),
    ];

    let lookups = scopes
        .iter()
        .cycle()
        .take(scopes.len() * 4)
        .map(|scope| router.resolve(scope));
    let results = join_all(lookups).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(router.factory().connects(), scopes.len());
    assert_eq!(router.cached_scopes().await.len(), scopes.len());
}

#[tokio::test]
async fn test_account_is_part_of_the_scope_key() {
    let router = RegionalClientRouter::new(ScriptedFactory::new());
    let plain = Scope::region("ap-beijing");
    let other_account = Scope::region("ap-beijing").with_account("100003");

    router.resolve(&plain).await.unwrap();
    router.resolve(&other_account).await.unwrap();
    router.resolve(&plain).await.unwrap();

    assert_eq!(router.factory().connects(), 2);
}
