//! Integration tests for reconciliation
//!
//! Tests convergence, idempotence, failure isolation and redemptions that
//! land while a flush is in progress

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;

/// After a run with no new redemptions the store holds the cache's counts
#[tokio::test]
async fn test_reconciliation_converges() {
    let system = setup_in_memory().await;
    let codes: Vec<String> = (0..5).map(|i| test_code(&format!("conv{i}"))).collect();
    for code in &codes {
        system
            .service()
            .create(&gift_request(code, 0))
            .await
            .unwrap();
    }
    for (i, code) in codes.iter().enumerate() {
        for _ in 0..=i {
            system.service().use_gift(code).await.unwrap();
        }
    }

    let report = system.reconciler().run_once().await.unwrap();
    assert_eq!(report.flushed, 5);
    assert!(report.is_clean());

    for (i, code) in codes.iter().enumerate() {
        let expected = i64::try_from(i).unwrap() + 1;
        assert_eq!(stored(&system, code).await.used_count, expected);
        assert_eq!(
            system.service().get_by_code(code).await.unwrap().used_count,
            expected
        );
    }
    system.shutdown().await;
}

/// A second run with nothing new performs no store writes
#[tokio::test]
async fn test_reconciliation_is_idempotent() {
    let store = InstrumentedStore::new();
    let system = setup_with_store(store.clone()).await;
    let code = test_code("idem");
    system
        .service()
        .create(&gift_request(&code, 0))
        .await
        .unwrap();
    system.service().use_gift(&code).await.unwrap();
    system.service().use_gift(&code).await.unwrap();

    system.reconciler().run_once().await.unwrap();
    assert_eq!(store.update_count(), 1);

    let second = system.reconciler().run_once().await.unwrap();
    assert_eq!(second.flushed, 0);
    assert_eq!(store.update_count(), 1, "second run must not write");
    assert_eq!(stored(&system, &code).await.used_count, 2);

    let stats = system.reconciler().stats();
    assert_eq!((stats.runs, stats.flushed), (2, 1));
    system.shutdown().await;
}

/// One failing key does not stop the others and is retried next run
#[tokio::test]
async fn test_failing_key_is_isolated_and_retried() {
    let store = InstrumentedStore::new();
    let system = setup_with_store(store.clone()).await;
    let good = test_code("good");
    let bad = test_code("bad");
    for code in [&good, &bad] {
        system
            .service()
            .create(&gift_request(code, 0))
            .await
            .unwrap();
        system.service().use_gift(code).await.unwrap();
    }
    store.fail_updates_for(&bad);

    let report = system.reconciler().run_once().await.unwrap();
    assert_eq!((report.flushed, report.failed), (1, 1));
    assert_eq!(stored(&system, &good).await.used_count, 1);
    assert_eq!(stored(&system, &bad).await.used_count, 0);
    assert!(
        system
            .service()
            .repository()
            .cache_state(&bad)
            .await
            .unwrap()
            .is_dirty()
    );
    // Still readable with the confirmed count while the store lags
    assert_eq!(system.service().get_by_code(&bad).await.unwrap().used_count, 1);

    store.heal();
    let retry = system.reconciler().run_once().await.unwrap();
    assert_eq!((retry.flushed, retry.failed), (1, 0));
    assert_eq!(stored(&system, &bad).await.used_count, 1);
    assert_eq!(system.reconciler().stats().failed_keys, 1);
    system.shutdown().await;
}

/// A redemption landing between the flush's read and its delete survives
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redemption_during_flush_is_not_lost() {
    let store = InstrumentedStore::new();
    let system = Arc::new(setup_with_store(store.clone()).await);
    let code = test_code("race");
    system
        .service()
        .create(&gift_request(&code, 0))
        .await
        .unwrap();
    system.service().use_gift(&code).await.unwrap();

    store.pause_next_update();
    let run = {
        let system = Arc::clone(&system);
        tokio::spawn(async move { system.reconciler().run_once().await })
    };
    tokio::time::timeout(Duration::from_secs(5), store.entered.notified())
        .await
        .unwrap_or_else(|_| panic!("Flush never reached the store"));

    // The flush holds used_count = 1; this redemption makes it 2
    let during = system.service().use_gift(&code).await.unwrap();
    assert_eq!(during.used_count, 2);
    store.resume.notify_one();

    let report = run.await.unwrap().unwrap();
    assert_eq!((report.flushed, report.superseded), (0, 1));
    assert!(
        system
            .service()
            .repository()
            .cache_state(&code)
            .await
            .unwrap()
            .is_dirty()
    );
    assert_eq!(system.service().get_by_code(&code).await.unwrap().used_count, 2);

    let next = system.reconciler().run_once().await.unwrap();
    assert_eq!(next.flushed, 1);
    assert_eq!(stored(&system, &code).await.used_count, 2);
    system.shutdown().await;
}

/// Dirty entries of gifts removed behind the repository's back are dropped
#[tokio::test]
async fn test_orphaned_dirty_entry_is_dropped() {
    let system = setup_in_memory().await;
    let code = test_code("orphan");
    system
        .service()
        .create(&gift_request(&code, 0))
        .await
        .unwrap();
    system.service().use_gift(&code).await.unwrap();
    system
        .service()
        .repository()
        .store()
        .delete_by_code(&code)
        .await
        .unwrap();

    let report = system.reconciler().run_once().await.unwrap();
    assert_eq!(report.orphaned, 1);
    assert!(
        system
            .service()
            .repository()
            .cache_state(&code)
            .await
            .unwrap()
            .gift()
            .is_none()
    );
    system.shutdown().await;
}
