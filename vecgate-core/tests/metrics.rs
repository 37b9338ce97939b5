//! Global counters. Kept alone in this binary so no other test touches them.

use std::sync::Arc;

use vecgate_core::metrics;
use vecgate_core::{BatchConfig, EngineConfig, Index, MetricType, MockEngine, Runtime};

#[test]
fn test_counters_follow_native_calls() {
    metrics::disable();
    metrics::reset();

    let batch = BatchConfig::default()
        .with_search_batch_size(2)
        .with_pinned_workers(0);
    let config = EngineConfig::default()
        .with_metrics(true)
        .with_batch(batch);
    let runtime = Runtime::new(Arc::new(MockEngine::new()), config).unwrap();
    assert!(metrics::is_enabled());

    let mut index = Index::flat(&runtime, 2, MetricType::L2).unwrap();
    index.add(&[0.0, 0.0, 1.0, 0.0, 0.0, 1.0]).unwrap();
    index.search(&[0.0; 10], 2).unwrap();
    index.range_search(&[0.0, 0.0], 1.5).unwrap();
    index.reset().unwrap();

    let snapshot = metrics::snapshot();
    assert_eq!(snapshot.add.count, 1);
    assert_eq!(snapshot.add.elements, 3);
    // Five queries split into sub-batches of two.
    assert_eq!(snapshot.search.count, 3);
    assert_eq!(snapshot.search.elements, 5);
    assert_eq!(snapshot.search.results, 10);
    assert_eq!(snapshot.range_search.count, 1);
    assert_eq!(snapshot.range_search.results, 3);
    assert_eq!(snapshot.reset.count, 1);
    assert_eq!(snapshot.train.count, 0);

    metrics::disable();
    index.search(&[0.0, 0.0], 1).unwrap();
    assert_eq!(metrics::snapshot().search.count, 3);
    metrics::reset();
    assert_eq!(metrics::snapshot().total_operations(), 0);
}
