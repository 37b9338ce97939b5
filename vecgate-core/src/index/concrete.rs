//! Standalone index constructors.

use crate::engine::QuantizerType;
use crate::error::{Error, Result};
use crate::handle::IndexKind;
use crate::metric::MetricType;
use crate::runtime::Runtime;

use super::Index;

pub(crate) fn check_dimension(d: usize) -> Result<()> {
    if d == 0 {
        return Err(Error::InvalidDimension(
            "dimension must be positive".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn check_pq(d: usize, m: usize, nbits: usize) -> Result<()> {
    if m == 0 || d % m != 0 {
        return Err(Error::InvalidParameter(format!(
            "dimension {} is not divisible into {} sub-quantizers",
            d, m
        )));
    }
    if !(1..=16).contains(&nbits) {
        return Err(Error::InvalidParameter(format!(
            "nbits must be in 1..=16, got {}",
            nbits
        )));
    }
    Ok(())
}

impl Index {
    /// Exhaustive search over raw vectors. Needs no training.
    ///
    /// # Example
    ///
    /// ```
    /// use vecgate_core::{Index, IndexKind, MetricType, Runtime};
    ///
    /// let runtime = Runtime::mock().unwrap();
    /// let index = Index::flat(&runtime, 128, MetricType::InnerProduct).unwrap();
    /// assert_eq!(index.kind(), IndexKind::Flat);
    /// assert!(index.is_trained());
    /// ```
    pub fn flat(runtime: &Runtime, d: usize, metric: MetricType) -> Result<Self> {
        check_dimension(d)?;
        let native = runtime
            .gateway()
            .call("index_flat_new", |e| e.index_flat_new(d, metric))?;
        Index::from_native(runtime, IndexKind::Flat, native)
    }

    /// Graph index with `m` links per node.
    pub fn hnsw_flat(runtime: &Runtime, d: usize, m: usize, metric: MetricType) -> Result<Self> {
        check_dimension(d)?;
        if m == 0 {
            return Err(Error::InvalidParameter("HNSW m must be positive".to_string()));
        }
        let native = runtime
            .gateway()
            .call("index_hnsw_flat_new", |e| e.index_hnsw_flat_new(d, m, metric))?;
        Index::from_native(runtime, IndexKind::Graph, native)
    }

    /// Product quantizer with `m` sub-quantizers of `nbits` bits each.
    pub fn pq(runtime: &Runtime, d: usize, m: usize, nbits: usize, metric: MetricType) -> Result<Self> {
        check_dimension(d)?;
        check_pq(d, m, nbits)?;
        let native = runtime
            .gateway()
            .call("index_pq_new", |e| e.index_pq_new(d, m, nbits, metric))?;
        Index::from_native(runtime, IndexKind::ProductQuantized, native)
    }

    /// Per-component scalar quantizer.
    pub fn scalar_quantizer(
        runtime: &Runtime,
        d: usize,
        qtype: QuantizerType,
        metric: MetricType,
    ) -> Result<Self> {
        check_dimension(d)?;
        let native = runtime
            .gateway()
            .call("index_sq_new", |e| e.index_sq_new(d, qtype, metric))?;
        Index::from_native(runtime, IndexKind::ScalarQuantized, native)
    }

    /// Locality-sensitive hashing into `nbits`-bit signatures.
    pub fn lsh(
        runtime: &Runtime,
        d: usize,
        nbits: usize,
        rotate_data: bool,
        train_thresholds: bool,
    ) -> Result<Self> {
        check_dimension(d)?;
        if nbits == 0 {
            return Err(Error::InvalidParameter("LSH nbits must be positive".to_string()));
        }
        let native = runtime.gateway().call("index_lsh_new", |e| {
            e.index_lsh_new(d, nbits, rotate_data, train_thresholds)
        })?;
        Index::from_native(runtime, IndexKind::LocalitySensitiveHash, native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::config::EngineConfig;
    use std::sync::Arc;

    fn setup() -> (Arc<MockEngine>, Runtime) {
        let engine = Arc::new(MockEngine::new());
        let runtime = Runtime::new(engine.clone(), EngineConfig::default()).unwrap();
        (engine, runtime)
    }

    #[test]
    fn test_zero_dimension_rejected_before_crossing() {
        let (engine, runtime) = setup();
        assert!(matches!(
            Index::flat(&runtime, 0, MetricType::L2),
            Err(Error::InvalidDimension(_))
        ));
        assert!(Index::pq(&runtime, 10, 3, 8, MetricType::L2).is_err());
        assert!(Index::pq(&runtime, 16, 4, 0, MetricType::L2).is_err());
        assert!(Index::hnsw_flat(&runtime, 8, 0, MetricType::L2).is_err());
        assert_eq!(engine.total_calls(), 0);
    }

    #[test]
    fn test_constructor_failure_surfaces_code() {
        let (engine, runtime) = setup();
        engine.fail_next("index_flat_new", -12);
        let err = Index::flat(&runtime, 8, MetricType::L2).unwrap_err();
        assert_eq!(err.native_code(), Some(-12));
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_describe_failure_frees_new_index() {
        let (engine, runtime) = setup();
        engine.fail_next("describe", -1);
        assert!(Index::flat(&runtime, 8, MetricType::L2).is_err());
        assert_eq!(engine.live_objects(), 0);
        assert_eq!(engine.calls("free"), 1);
    }

    #[test]
    fn test_kinds_and_training_state() {
        let (_engine, runtime) = setup();
        let hnsw = Index::hnsw_flat(&runtime, 8, 16, MetricType::L2).unwrap();
        assert_eq!(hnsw.kind(), IndexKind::Graph);
        assert!(hnsw.is_trained());

        let pq = Index::pq(&runtime, 8, 2, 4, MetricType::L2).unwrap();
        assert_eq!(pq.kind(), IndexKind::ProductQuantized);
        assert!(!pq.is_trained());

        let sq = Index::scalar_quantizer(&runtime, 8, QuantizerType::Fp16, MetricType::L2).unwrap();
        assert!(sq.is_trained());

        let lsh = Index::lsh(&runtime, 8, 16, false, false).unwrap();
        assert!(matches!(
            lsh.reconstruct(0),
            Err(Error::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_graph_parameters() {
        let (_engine, runtime) = setup();
        let mut index = Index::hnsw_flat(&runtime, 4, 16, MetricType::L2).unwrap();
        assert_eq!(index.get_parameter("efSearch").unwrap(), 16.0);
        index.set_ef_search(64).unwrap();
        assert_eq!(index.get_parameter("efSearch").unwrap(), 64.0);
        assert!(matches!(
            index.set_ef_search(0),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            index.set_nprobe(4),
            Err(Error::UnsupportedOperation {
                operation: "nprobe",
                kind: IndexKind::Graph
            })
        ));
    }
}
