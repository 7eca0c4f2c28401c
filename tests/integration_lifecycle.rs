//! Integration tests for the gift lifecycle
//!
//! Tests creation (generated and literal codes), lookups, listing,
//! administrative updates and deletes

mod common;

use common::*;
use gift_redemption::{CacheState, GiftConfig, GiftError, GiftSystem, PageRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Concurrent creations sharing a prefix never share a code
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_create_same_prefix_yields_unique_codes() {
    let system = Arc::new(setup_in_memory().await);

    let mut tasks = JoinSet::new();
    for _ in 0..64 {
        let system = Arc::clone(&system);
        tasks.spawn(async move { system.service().create(&prefixed_request("SPRING")).await });
    }

    let mut codes = HashSet::new();
    while let Some(result) = tasks.join_next().await {
        let gift = result
            .unwrap_or_else(|_| panic!("Task panicked"))
            .unwrap_or_else(|e| panic!("Create failed: {e}"));
        assert!(gift.code.starts_with("SPRING-"));
        assert_eq!(gift.code.len(), "SPRING-".len() + 6);
        assert!(codes.insert(gift.code), "duplicate generated code");
    }
    assert_eq!(codes.len(), 64);

    let page = system
        .service()
        .list(PageRequest {
            limit: 100,
            offset: 0,
            with_total: true,
        })
        .await
        .unwrap();
    assert_eq!(page.total, Some(64));
    system.shutdown().await;
}

#[tokio::test]
async fn test_bulk_create_and_paged_listing() {
    let system = setup_in_memory().await;
    let reqs: Vec<_> = (0..5).map(|i| gift_request(&format!("BULK{i}"), 1)).collect();
    let created = system.service().create_bulk(&reqs).await.unwrap();
    assert_eq!(created.len(), 5);

    let first = system
        .service()
        .list(PageRequest {
            limit: 2,
            offset: 0,
            with_total: true,
        })
        .await
        .unwrap();
    assert_eq!(first.items.len(), 2);
    assert_eq!(first.total, Some(5));
    assert_eq!(first.items[0].code, "BULK4", "newest first");

    let last = system
        .service()
        .list(PageRequest {
            limit: 2,
            offset: 4,
            with_total: false,
        })
        .await
        .unwrap();
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.total, None);

    // Bulk create stops at the first duplicate and keeps what came before
    let again = vec![gift_request("BULK5", 1), gift_request("BULK0", 1)];
    assert!(matches!(
        system.service().create_bulk(&again).await,
        Err(GiftError::DuplicateGiftCode(code)) if code == "BULK0"
    ));
    assert!(system.service().get_by_code("BULK5").await.is_ok());
    system.shutdown().await;
}

/// Direct update starts from the flushed state and refreshes the cache
#[tokio::test]
async fn test_update_by_code_flushes_pending_redemptions() {
    let system = setup_in_memory().await;
    let code = test_code("admin");
    let created = system
        .service()
        .create(&gift_request(&code, 5))
        .await
        .unwrap();
    system.service().use_gift(&code).await.unwrap();
    system.service().use_gift(&code).await.unwrap();

    let current = system.service().get_by_code(&code).await.unwrap();
    let updated = system
        .service()
        .update_by_code(gift_redemption::Gift {
            gift_amount: 5000,
            usage_limit: 3,
            ..current
        })
        .await
        .unwrap();
    assert_eq!(updated.id, created.id);
    assert_eq!((updated.used_count, updated.usage_limit), (2, 3));

    let row = stored(&system, &code).await;
    assert_eq!((row.gift_amount, row.used_count), (5000, 2));

    system.service().use_gift(&code).await.unwrap();
    assert!(matches!(
        system.service().use_gift(&code).await,
        Err(GiftError::UsageLimitReached(_))
    ));
    system.shutdown().await;
}

#[tokio::test]
async fn test_update_by_code_unknown_id() {
    let system = setup_in_memory().await;
    let mut gift = system
        .service()
        .create(&gift_request(&test_code("ghost"), 1))
        .await
        .unwrap();
    gift.id += 1000;
    let err = system.service().update_by_code(gift).await.unwrap_err();
    assert!(matches!(err, GiftError::InvalidGiftId(_)));
    assert_eq!(err.status_code(), 400);
    system.shutdown().await;
}

/// Deleting a gift discards its unflushed redemptions
#[tokio::test]
async fn test_delete_discards_pending_redemptions() {
    let system = setup_in_memory().await;
    let code = test_code("doomed");
    system
        .service()
        .create(&gift_request(&code, 0))
        .await
        .unwrap();
    system.service().use_gift(&code).await.unwrap();

    system.service().delete_by_code(&code).await.unwrap();
    assert_eq!(
        system.service().repository().cache_state(&code).await.unwrap(),
        CacheState::Absent
    );
    assert!(matches!(
        system.service().get_by_code(&code).await,
        Err(GiftError::InvalidGiftCode(_))
    ));
    assert_eq!(system.service().repository().stats().discarded_dirty, 1);

    let report = system.reconciler().run_once().await.unwrap();
    assert_eq!(report.flushed, 0);
    system.shutdown().await;
}

#[tokio::test]
async fn test_bulk_delete_by_ids_and_codes() {
    let system = setup_in_memory().await;
    let mut ids = Vec::new();
    for code in ["DEL1", "DEL2", "DEL3", "DEL4"] {
        ids.push(
            system
                .service()
                .create(&gift_request(code, 1))
                .await
                .unwrap()
                .id,
        );
    }

    system.service().delete_bulk_by_ids(&ids[..2]).await.unwrap();
    system
        .service()
        .delete_bulk_by_codes(&["DEL3".to_string(), "DEL4".to_string()])
        .await
        .unwrap();

    let page = system
        .service()
        .list(PageRequest {
            with_total: true,
            ..PageRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, Some(0));
    assert!(matches!(
        system.service().delete(ids[0]).await,
        Err(GiftError::InvalidGiftId(_))
    ));
    system.shutdown().await;
}

#[tokio::test]
async fn test_get_by_id_reflects_unflushed_redemptions() {
    let system = setup_in_memory().await;
    let code = test_code("byid");
    let created = system
        .service()
        .create(&gift_request(&code, 2))
        .await
        .unwrap();
    system.service().use_gift(&code).await.unwrap();

    let gift = system.service().get_by_id(created.id).await.unwrap();
    assert_eq!(gift.used_count, 1);
    assert_eq!(gift.remaining_uses(), Some(1));
    system.shutdown().await;
}

#[tokio::test]
async fn test_in_memory_system_is_healthy() {
    let system = GiftSystem::in_memory().await.unwrap();
    assert!(system.health_check().await);
    assert!(system.reconciler().is_running());
    system.shutdown().await;
    assert!(!system.reconciler().is_running());
}

/// A unique violation from the store draws a fresh generated code
#[tokio::test]
async fn test_create_retries_when_store_rejects_generated_code() {
    let store = InstrumentedStore::new();
    let system = setup_with_store(store.clone()).await;
    store.reject_next_inserts(3);

    let gift = system
        .service()
        .create(&prefixed_request("RETRY"))
        .await
        .unwrap();
    assert!(gift.code.starts_with("RETRY-"));
    assert_eq!(store.insert_count(), 4);
    assert_eq!(
        system.service().get_by_code(&gift.code).await.unwrap().id,
        gift.id
    );
    system.shutdown().await;
}

#[tokio::test]
async fn test_create_gives_up_when_every_generated_code_collides() {
    let store = InstrumentedStore::new();
    let system = setup_with_store(store.clone()).await;
    store.reject_next_inserts(usize::MAX);

    let attempts = GiftConfig::default().max_code_attempts;
    let err = system
        .service()
        .create(&prefixed_request("FULL"))
        .await
        .unwrap_err();
    assert!(matches!(err, GiftError::CodeSpaceExhausted(n) if n == attempts));
    assert_eq!(err.status_code(), 500);
    assert_eq!(store.insert_count(), attempts);
    system.shutdown().await;
}

/// An update built from an old read keeps every confirmed redemption
#[tokio::test]
async fn test_update_by_code_with_stale_snapshot_keeps_redemptions() {
    let system = setup_in_memory().await;
    let code = test_code("stale");
    let snapshot = system
        .service()
        .create(&gift_request(&code, 3))
        .await
        .unwrap();
    system.service().use_gift(&code).await.unwrap();
    system.service().use_gift(&code).await.unwrap();

    let updated = system
        .service()
        .update_by_code(gift_redemption::Gift {
            gift_amount: 4000,
            ..snapshot.clone()
        })
        .await
        .unwrap();
    assert_eq!((updated.gift_amount, updated.used_count), (4000, 2));
    assert_eq!(stored(&system, &code).await.used_count, 2);

    let mut accepted = 0;
    for _ in 0..5 {
        if system.service().use_gift(&code).await.is_ok() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1, "only one use left under the limit of 3");

    let err = system
        .service()
        .update_by_code(gift_redemption::Gift {
            usage_limit: 1,
            ..snapshot
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GiftError::InvalidRequest { field: "usageLimit", .. }));
    assert_eq!(err.status_code(), 400);

    system.reconciler().run_once().await.unwrap();
    let row = stored(&system, &code).await;
    assert_eq!((row.usage_limit, row.used_count), (3, 3));
    system.shutdown().await;
}

/// A read that fetched the row before a delete cannot bring it back
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_racing_delete_does_not_resurrect_gift() {
    let store = InstrumentedStore::new();
    let system = Arc::new(setup_with_store(store.clone()).await);
    let code = test_code("ghost");
    system
        .service()
        .create(&gift_request(&code, 0))
        .await
        .unwrap();

    store.pause_next_select();
    let reader = {
        let system = Arc::clone(&system);
        let code = code.clone();
        tokio::spawn(async move { system.service().get_by_code(&code).await })
    };
    tokio::time::timeout(Duration::from_secs(5), store.entered.notified())
        .await
        .unwrap_or_else(|_| panic!("Read never reached the store"));

    system.service().delete_by_code(&code).await.unwrap();
    store.resume.notify_one();

    // The reader saw the row before it was deleted
    assert_eq!(reader.await.unwrap().unwrap().code, code);

    assert_eq!(
        system.service().repository().cache_state(&code).await.unwrap(),
        CacheState::Absent
    );
    assert!(matches!(
        system.service().get_by_code(&code).await,
        Err(GiftError::InvalidGiftCode(_))
    ));
    assert!(matches!(
        system.service().use_gift(&code).await,
        Err(GiftError::InvalidGiftCode(_))
    ));
    system.shutdown().await;
}
