use engage_core::SessionResult;
use engage_test_utils::{batch, TestHarness};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Ingest `batches` in order into a fresh session and return the final result
async fn ingest_all(batches: &[Vec<(i64, f64)>]) -> SessionResult {
    let h = TestHarness::new();
    let id = h.open(42, "v1").await.session.session_id;
    for samples in batches {
        h.service.ingest_batch(batch(id, samples)).await.unwrap();
    }
    let mut result = h.service.session_result(&id).await.unwrap();
    // ids and timestamps differ between harnesses
    result.session_id = engage_core::SessionId::from_bytes([0; 16]);
    for sample in &mut result.timeline {
        sample.session_id = result.session_id;
    }
    result
}

fn samples_strategy() -> impl Strategy<Value = Vec<(i64, f64)>> {
    prop::collection::btree_map(0i64..60, 0u32..=100, 1..40).prop_map(|map| {
        map.into_iter()
            .map(|(seq, score)| (seq, f64::from(score) / 100.0))
            .collect()
    })
}

/// Samples together with a permutation of them
fn permuted_strategy() -> impl Strategy<Value = (Vec<(i64, f64)>, Vec<(i64, f64)>)> {
    samples_strategy()
        .prop_flat_map(|samples| (Just(samples.clone()), Just(samples).prop_shuffle()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_arrival_order_does_not_change_result(
        (samples, shuffled) in permuted_strategy(),
        chunk in 1usize..8,
    ) {
        let in_order: Vec<Vec<(i64, f64)>> = samples.chunks(chunk).map(<[_]>::to_vec).collect();
        let out_of_order: Vec<Vec<(i64, f64)>> = shuffled.chunks(chunk).map(<[_]>::to_vec).collect();

        let rt = runtime();
        let a = rt.block_on(ingest_all(&in_order));
        let b = rt.block_on(ingest_all(&out_of_order));
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_replay_is_idempotent(samples in samples_strategy()) {
        let rt = runtime();
        rt.block_on(async {
            let h = TestHarness::new();
            let id = h.open(42, "v1").await.session.session_id;

            let first = h.service.ingest_batch(batch(id, &samples)).await.unwrap();
            let before = h.service.session_result(&id).await.unwrap();
            let replay = h.service.ingest_batch(batch(id, &samples)).await.unwrap();
            let after = h.service.session_result(&id).await.unwrap();

            assert_eq!(first.accepted_count, samples.len());
            assert_eq!(replay.accepted_count, 0);
            assert_eq!(replay.duplicate_count, samples.len());
            assert_eq!(before, after);
        });
    }

    #[test]
    fn prop_counts_partition_the_batch(
        seqs in prop::collection::vec(-5i64..20, 0..50),
        scores in prop::collection::vec(-0.5f64..1.5, 50),
    ) {
        let samples: Vec<(i64, f64)> = seqs.iter().zip(&scores).map(|(&s, &c)| (s, c)).collect();
        let rt = runtime();
        rt.block_on(async {
            let h = TestHarness::new();
            let id = h.open(42, "v1").await.session.session_id;
            let result = h.service.ingest_batch(batch(id, &samples)).await.unwrap();

            assert_eq!(result.total(), samples.len());
            assert_eq!(result.rejections.len(), result.rejected_count);
            assert_eq!(h.log.len(&id), result.accepted_count);
        });
    }
}
