use std::sync::Arc;

use proptest::prelude::*;
use vecgate_core::{
    Adoption, BatchConfig, EngineConfig, Error, Index, MetricType, MockEngine, Runtime,
};

fn runtime_with(batch: BatchConfig) -> (Arc<MockEngine>, Runtime) {
    let engine = Arc::new(MockEngine::new());
    let config = EngineConfig::default().with_batch(batch);
    let runtime = Runtime::new(engine.clone(), config).unwrap();
    (engine, runtime)
}

fn single_call_runtime() -> (Arc<MockEngine>, Runtime) {
    runtime_with(BatchConfig::default().with_pinned_workers(0))
}

proptest! {
    #[test]
    fn test_ragged_buffers_never_cross(
        d in 2usize..16,
        rows in 0usize..8,
        extra in 1usize..16,
    ) {
        let extra = extra % d;
        prop_assume!(extra != 0);
        let (engine, runtime) = single_call_runtime();
        let mut index = Index::flat(&runtime, d, MetricType::L2).unwrap();
        engine.reset_calls();

        let buffer = vec![0.5f32; rows * d + extra];
        let is_length_error = matches!(
            index.add(&buffer),
            Err(Error::InvalidVectorLength { .. })
        );
        prop_assert!(is_length_error);
        prop_assert!(index.search(&buffer, 1).is_err());
        prop_assert!(index.train(&buffer).is_err());
        prop_assert_eq!(engine.total_calls(), 0);
        prop_assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_release_is_idempotent(times in 1usize..6) {
        let (engine, runtime) = single_call_runtime();
        let index = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        for _ in 0..times {
            prop_assert!(index.release().is_ok());
        }
        drop(index);
        prop_assert_eq!(engine.calls("free"), 1);
        prop_assert_eq!(engine.live_objects(), 0);
        prop_assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_tree_freed_once_in_any_order(
        release_child_first in any::<bool>(),
        borrowed in any::<bool>(),
        drop_instead in any::<bool>(),
    ) {
        let (engine, runtime) = single_call_runtime();
        let quantizer = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let adoption = if borrowed { Adoption::Borrowed } else { Adoption::Owned };
        let ivf = Index::ivf_flat(&quantizer, 2, MetricType::L2, adoption).unwrap();

        if release_child_first {
            let result = quantizer.release();
            if borrowed {
                prop_assert!(result.is_ok());
            } else {
                let is_conflict = matches!(result, Err(Error::OwnershipConflict(_)));
                prop_assert!(is_conflict);
            }
        }
        if drop_instead {
            drop(ivf);
        } else {
            prop_assert!(ivf.release().is_ok());
        }
        prop_assert!(quantizer.release().is_ok());
        drop(quantizer);

        prop_assert_eq!(engine.live_objects(), 0);
        prop_assert!(engine.violations().is_empty());
        prop_assert_eq!(engine.calls("free"), 2);
    }

    #[test]
    fn test_split_batches_match_single_call(
        n in 1usize..40,
        nq in 1usize..30,
        k in 1usize..6,
        search_batch in 1usize..8,
        add_batch in 1usize..8,
        seed in any::<u64>(),
    ) {
        let d = 3;
        let data: Vec<f32> = (0..n * d)
            .map(|i| ((i as u64).wrapping_mul(seed | 1) % 97) as f32)
            .collect();
        let queries: Vec<f32> = (0..nq * d)
            .map(|i| ((i as u64).wrapping_add(seed) % 89) as f32)
            .collect();

        let (_e1, whole_rt) = single_call_runtime();
        let mut whole = Index::flat(&whole_rt, d, MetricType::L2).unwrap();
        whole.add(&data).unwrap();
        let expected = whole.search(&queries, k).unwrap();

        let batch = BatchConfig::default()
            .with_search_batch_size(search_batch)
            .with_add_batch_size(add_batch)
            .with_pin_threshold(4)
            .with_pinned_workers(1);
        let (engine, split_rt) = runtime_with(batch);
        let mut split = Index::flat(&split_rt, d, MetricType::L2).unwrap();
        split.add(&data).unwrap();
        prop_assert_eq!(split.len(), n);
        prop_assert_eq!(engine.calls("add") as usize, n.div_ceil(add_batch));

        let actual = split.search(&queries, k).unwrap();
        prop_assert_eq!(engine.calls("search") as usize, nq.div_ceil(search_batch));
        prop_assert_eq!(actual.labels(), expected.labels());
        prop_assert_eq!(actual.distances(), expected.distances());
    }
}
