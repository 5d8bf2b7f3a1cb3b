use engage_core::{EngageConfig, WatchEnd, WatchError};
use engage_test_utils::{batch, TestHarness};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_sessions_are_isolated() {
    let h = Arc::new(TestHarness::new());
    let mut tasks = Vec::new();
    for user in 0..32u64 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            let id = h.open(user, "v1").await.session.session_id;
            for start in (0..20).step_by(5) {
                let samples: Vec<(i64, f64)> = (start..start + 5).map(|s| (s, 0.5)).collect();
                h.service.ingest_batch(batch(id, &samples)).await.unwrap();
            }
            id
        }));
    }

    for task in tasks {
        let id = task.await.unwrap();
        let result = h.service.session_result(&id).await.unwrap();
        assert_eq!(result.timeline.len(), 20);
        assert!(result.timeline.iter().all(|s| s.session_id == id));
    }
    assert_eq!(h.service.stats().live, 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_same_session_accept_each_sample_once() {
    let config = EngageConfig::new().with_max_pending_batches(64);
    let h = Arc::new(TestHarness::with_config(config));
    let id = h.open(42, "v1").await.session.session_id;

    // overlapping windows: every sequence in 0..40 is sent by several tasks
    let mut tasks = Vec::new();
    for start in 0..30i64 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            let samples: Vec<(i64, f64)> = (start..start + 10).map(|s| (s, 0.5)).collect();
            h.service.ingest_batch(batch(id, &samples)).await.unwrap()
        }));
    }

    let mut accepted = 0;
    let mut duplicates = 0;
    for task in tasks {
        let result = task.await.unwrap();
        accepted += result.accepted_count;
        duplicates += result.duplicate_count;
    }
    assert_eq!(accepted, 39);
    assert_eq!(accepted + duplicates, 300);
    assert_eq!(h.log.len(&id), 39);

    let session = h.service.registry().snapshot(&id).unwrap();
    assert_eq!(session.watermark, Some(38));
    assert_eq!(session.accepted_count, 39);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_issue_converges_on_one_session() {
    let h = Arc::new(TestHarness::new());
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move { h.open(42, "v1").await }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().session.session_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.service.stats().live, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_races_with_ingest() {
    let h = Arc::new(TestHarness::new());
    let id = h.open(42, "v1").await.session.session_id;

    let ingest = {
        let h = h.clone();
        tokio::spawn(async move {
            let mut accepted = 0;
            for seq in 0..50i64 {
                match h.service.ingest_batch(batch(id, &[(seq, 0.5)])).await {
                    Ok(result) => accepted += result.accepted_count,
                    Err(WatchError::SessionClosed(_)) => break,
                    Err(WatchError::Backpressure(_)) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
                tokio::task::yield_now().await;
            }
            accepted
        })
    };
    tokio::task::yield_now().await;
    let closed = h.service.end_session(WatchEnd { session_id: id }).await.unwrap();
    let accepted = ingest.await.unwrap();

    // nothing lands after the close
    assert_eq!(h.log.len(&id), accepted);
    let session = h.service.registry().snapshot(&id).unwrap();
    assert_eq!(session.accepted_count, closed.accepted_count);
}
