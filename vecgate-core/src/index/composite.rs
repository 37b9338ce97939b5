//! Indexes built over child handles.
//!
//! Each constructor here goes through the ownership coordinator: children
//! are checked, the native composite is built, its native ownership flag is
//! cleared, and the managed mirror records which children it owns or
//! borrows. See [`crate::ownership`] for the rules.

use crate::engine::{NativeClass, NativeEngine, NativeRef, NativeResult, QuantizerType};
use crate::error::{Error, Result};
use crate::handle::IndexKind;
use crate::metric::MetricType;
use crate::ownership::{self, Adoption};
use crate::runtime::Runtime;
use crate::transform::VectorTransform;

use super::concrete::{check_dimension, check_pq};
use super::{Capabilities, Index};

fn check_metric(expected: MetricType, child: &Index, role: &str) -> Result<()> {
    if child.metric() != expected {
        return Err(Error::InvalidParameter(format!(
            "{} metric {} differs from {}",
            role,
            child.metric(),
            expected
        )));
    }
    Ok(())
}

fn check_same_dimension(expected: usize, child: &Index, role: &str) -> Result<()> {
    if child.dimension() != expected {
        return Err(Error::InvalidDimension(format!(
            "{} has dimension {}, expected {}",
            role,
            child.dimension(),
            expected
        )));
    }
    Ok(())
}

impl Index {
    /// Wraps `base` so vectors can be added under caller-chosen ids.
    ///
    /// The id map owns `base`: releasing the id map releases it, and `base`
    /// cannot be released on its own while the id map is alive.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] if `base` already holds vectors, and
    /// [`Error::OwnershipConflict`] if another composite owns it.
    pub fn id_map(base: &Index) -> Result<Self> {
        base.require_float("id_map")?;
        if !base.is_empty() {
            return Err(Error::InvalidParameter(
                "the base of an id map must be empty".to_string(),
            ));
        }
        let runtime = base.runtime();
        let gateway = runtime.gateway();
        let handle = ownership::compose(
            gateway,
            NativeClass::Index,
            &[(base.handle(), Adoption::Owned)],
            |refs| gateway.call("index_idmap_new", |e| e.index_idmap_new(refs[0])),
        )?;
        let caps = Capabilities {
            custom_ids: true,
            positional_keys: false,
            ..base.capabilities()
        };
        Ok(
            Index::from_handle(runtime, handle, IndexKind::IdMap, base.dimension(), base.metric())
                .with_nlist(base.nlist())
                .with_capabilities(caps),
        )
    }

    fn ivf_over(
        quantizer: &Index,
        nlist: usize,
        metric: MetricType,
        adoption: Adoption,
        function: &'static str,
        construct: impl FnOnce(&dyn NativeEngine, NativeRef) -> NativeResult<NativeRef>,
    ) -> Result<Self> {
        quantizer.require_float("ivf")?;
        if nlist == 0 {
            return Err(Error::InvalidParameter("nlist must be positive".to_string()));
        }
        check_metric(metric, quantizer, "quantizer")?;
        let runtime = quantizer.runtime();
        let gateway = runtime.gateway();
        let handle = ownership::compose(
            gateway,
            NativeClass::Index,
            &[(quantizer.handle(), adoption)],
            |refs| gateway.call(function, |e| construct(e, refs[0])),
        )?;
        Ok(Index::from_handle(
            runtime,
            handle,
            IndexKind::InvertedFile,
            quantizer.dimension(),
            metric,
        )
        .with_nlist(Some(nlist)))
    }

    /// Inverted lists of raw vectors over a coarse `quantizer`.
    ///
    /// `adoption` selects whether the new index owns the quantizer or only
    /// borrows it. Training needs at least
    /// [`MIN_POINTS_PER_CENTROID`](super::MIN_POINTS_PER_CENTROID) vectors
    /// per list.
    ///
    /// # Example
    ///
    /// ```
    /// use vecgate_core::{Adoption, Index, MetricType, Runtime};
    ///
    /// let runtime = Runtime::mock().unwrap();
    /// let quantizer = Index::flat(&runtime, 8, MetricType::L2).unwrap();
    /// let ivf = Index::ivf_flat(&quantizer, 4, MetricType::L2, Adoption::Owned).unwrap();
    /// assert_eq!(quantizer.owner(), Some(ivf.id()));
    /// assert!(!ivf.is_trained());
    /// ```
    pub fn ivf_flat(
        quantizer: &Index,
        nlist: usize,
        metric: MetricType,
        adoption: Adoption,
    ) -> Result<Self> {
        let d = quantizer.dimension();
        Self::ivf_over(quantizer, nlist, metric, adoption, "index_ivf_flat_new", |e, q| {
            e.index_ivf_flat_new(q, d, nlist, metric)
        })
    }

    /// Inverted lists of product-quantized codes.
    pub fn ivf_pq(
        quantizer: &Index,
        nlist: usize,
        m: usize,
        nbits: usize,
        metric: MetricType,
        adoption: Adoption,
    ) -> Result<Self> {
        let d = quantizer.dimension();
        check_pq(d, m, nbits)?;
        Self::ivf_over(quantizer, nlist, metric, adoption, "index_ivf_pq_new", |e, q| {
            e.index_ivf_pq_new(q, d, nlist, m, nbits, metric)
        })
    }

    /// Inverted lists of scalar-quantized codes.
    pub fn ivf_sq(
        quantizer: &Index,
        nlist: usize,
        qtype: QuantizerType,
        metric: MetricType,
        adoption: Adoption,
    ) -> Result<Self> {
        let d = quantizer.dimension();
        Self::ivf_over(quantizer, nlist, metric, adoption, "index_ivf_sq_new", |e, q| {
            e.index_ivf_sq_new(q, d, nlist, qtype, metric)
        })
    }

    /// Searches `base` for candidates and re-ranks them with the exact
    /// distances stored in `refine`. Owns both children.
    pub fn refine(base: &Index, refine: &Index) -> Result<Self> {
        base.require_float("refine")?;
        refine.require_float("refine")?;
        check_same_dimension(base.dimension(), refine, "refine index")?;
        check_metric(base.metric(), refine, "refine index")?;
        base.runtime().ensure_same_engine(refine.runtime())?;

        let runtime = base.runtime();
        let gateway = runtime.gateway();
        let handle = ownership::compose(
            gateway,
            NativeClass::Index,
            &[
                (base.handle(), Adoption::Owned),
                (refine.handle(), Adoption::Owned),
            ],
            |refs| {
                gateway.call("index_refine_new", |e| {
                    e.index_refine_new(refs[0], refs[1])
                })
            },
        )?;
        let base_caps = base.capabilities();
        let caps = Capabilities {
            k_factor: true,
            custom_ids: false,
            reconstruct: true,
            ..base_caps
        };
        Ok(
            Index::from_handle(runtime, handle, IndexKind::Refine, base.dimension(), base.metric())
                .with_nlist(base.nlist())
                .with_capabilities(caps),
        )
    }

    /// Applies `transform` to every vector before handing it to `index`.
    /// Owns both children. The composite's dimension is the transform's
    /// input dimension.
    pub fn pre_transform(transform: &VectorTransform, index: &Index) -> Result<Self> {
        index.require_float("pre_transform")?;
        if transform.d_out() != index.dimension() {
            return Err(Error::InvalidDimension(format!(
                "transform outputs {} components, index expects {}",
                transform.d_out(),
                index.dimension()
            )));
        }
        index.runtime().ensure_same_engine(transform.runtime())?;

        let runtime = index.runtime();
        let gateway = runtime.gateway();
        let handle = ownership::compose(
            gateway,
            NativeClass::Index,
            &[
                (transform.handle(), Adoption::Owned),
                (index.handle(), Adoption::Owned),
            ],
            |refs| {
                gateway.call("index_pretransform_new", |e| {
                    e.index_pretransform_new(refs[0], refs[1])
                })
            },
        )?;
        let caps = Capabilities {
            positional_keys: false,
            ..index.capabilities()
        };
        Ok(Index::from_handle(
            runtime,
            handle,
            IndexKind::PreTransform,
            transform.d_in(),
            index.metric(),
        )
        .with_nlist(index.nlist())
        .with_capabilities(caps))
    }

    /// An empty fan-out index. Add shards with [`add_shard`](Self::add_shard).
    pub fn shards(runtime: &Runtime, d: usize, metric: MetricType) -> Result<Self> {
        check_dimension(d)?;
        let native = runtime
            .gateway()
            .call("index_shards_new", |e| e.index_shards_new(d, metric))?;
        Index::from_native(runtime, IndexKind::Shards, native)
    }

    /// Attaches `shard`, which this index then owns. Added vectors are spread
    /// across shards; searches merge the per-shard results.
    pub fn add_shard(&mut self, shard: &Index) -> Result<()> {
        if self.kind() != IndexKind::Shards {
            return Err(Error::UnsupportedOperation {
                operation: "add_shard",
                kind: self.kind(),
            });
        }
        shard.require_float("add_shard")?;
        check_same_dimension(self.dimension(), shard, "shard")?;
        check_metric(self.metric(), shard, "shard")?;
        self.runtime().ensure_same_engine(shard.runtime())?;

        let gateway = self.runtime().gateway();
        ownership::adopt_into(gateway, self.handle(), shard.handle(), |shards, child| {
            gateway.call("index_shards_add_shard", |e| {
                e.index_shards_add_shard(shards, child)
            })
        })?;
        self.refresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::MockEngine;
    use crate::index::MIN_POINTS_PER_CENTROID;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::Arc;

    fn setup() -> (Arc<MockEngine>, Runtime) {
        let engine = Arc::new(MockEngine::new());
        let runtime = Runtime::new(engine.clone(), EngineConfig::default()).unwrap();
        (engine, runtime)
    }

    fn random_vectors(n: usize, d: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * d).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_id_map_uses_caller_ids() {
        let (engine, runtime) = setup();
        let base = Index::flat(&runtime, 2, MetricType::L2).unwrap();
        let mut index = Index::id_map(&base).unwrap();

        index
            .add_with_ids(&[0.0, 0.0, 5.0, 5.0], &[100, 200])
            .unwrap();
        assert_eq!(index.len(), 2);
        let results = index.search(&[5.0, 5.0], 1).unwrap();
        assert_eq!(results.labels(), &[200]);
        assert_eq!(index.reconstruct(100).unwrap(), vec![0.0, 0.0]);

        assert!(matches!(
            index.add_with_ids(&[1.0, 1.0], &[1, 2]),
            Err(Error::InvalidIds { ids: 2, vectors: 1 })
        ));

        // Plain add numbers from the current count.
        index.add(&[9.0, 9.0]).unwrap();
        assert_eq!(index.search(&[9.0, 9.0], 1).unwrap().labels(), &[2]);

        assert!(matches!(base.release(), Err(Error::OwnershipConflict(_))));
        index.release().unwrap();
        assert!(base.is_released());
        base.release().unwrap();
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_id_map_requires_empty_base() {
        let (_engine, runtime) = setup();
        let mut base = Index::flat(&runtime, 2, MetricType::L2).unwrap();
        base.add(&[1.0, 1.0]).unwrap();
        assert!(matches!(
            Index::id_map(&base),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_ivf_training_requirements() {
        let (engine, runtime) = setup();
        let quantizer = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let mut ivf = Index::ivf_flat(&quantizer, 8, MetricType::L2, Adoption::Owned).unwrap();

        assert!(matches!(
            ivf.add(&random_vectors(10, 4, 1)),
            Err(Error::NotTrained)
        ));
        let need = 8 * MIN_POINTS_PER_CENTROID;
        let calls = engine.calls("train");
        assert!(matches!(
            ivf.train(&random_vectors(need - 1, 4, 2)),
            Err(Error::InsufficientTrainingData { have, need: n }) if have == need - 1 && n == need
        ));
        assert_eq!(engine.calls("train"), calls);

        ivf.train(&random_vectors(need, 4, 3)).unwrap();
        assert!(ivf.is_trained());
        ivf.train(&random_vectors(need, 4, 4)).unwrap();
        assert_eq!(engine.calls("train"), calls + 1);

        ivf.add(&random_vectors(100, 4, 5)).unwrap();
        assert_eq!(ivf.len(), 100);
        ivf.set_nprobe(8).unwrap();
        assert_eq!(ivf.get_parameter("nprobe").unwrap(), 8.0);
        assert!(matches!(ivf.set_nprobe(9), Err(Error::InvalidParameter(_))));
        assert!(matches!(ivf.set_nprobe(0), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_ivf_metric_mismatch() {
        let (_engine, runtime) = setup();
        let quantizer = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        assert!(matches!(
            Index::ivf_flat(&quantizer, 4, MetricType::InnerProduct, Adoption::Owned),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(quantizer.owner(), None);
    }

    #[test]
    fn test_borrowed_quantizer() {
        let (engine, runtime) = setup();
        let quantizer = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let first = Index::ivf_flat(&quantizer, 2, MetricType::L2, Adoption::Borrowed).unwrap();
        let second = Index::ivf_flat(&quantizer, 2, MetricType::L2, Adoption::Borrowed).unwrap();
        assert_eq!(quantizer.borrowers(), 2);
        assert_eq!(first.referenced_children(), vec![quantizer.id()]);
        assert!(first.owned_children().is_empty());

        first.release().unwrap();
        second.release().unwrap();
        assert!(!quantizer.is_released());
        assert_eq!(quantizer.borrowers(), 0);
        quantizer.release().unwrap();
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_quantizer_owned_once() {
        let (_engine, runtime) = setup();
        let quantizer = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let _ivf = Index::ivf_flat(&quantizer, 2, MetricType::L2, Adoption::Owned).unwrap();
        assert!(matches!(
            Index::ivf_flat(&quantizer, 2, MetricType::L2, Adoption::Owned),
            Err(Error::OwnershipConflict(_))
        ));
    }

    #[test]
    fn test_refine_over_ivf_releases_everything_once() {
        let (engine, runtime) = setup();
        let quantizer = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let base = Index::ivf_flat(&quantizer, 2, MetricType::L2, Adoption::Owned).unwrap();
        let exact = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let mut refine = Index::refine(&base, &exact).unwrap();
        assert_eq!(refine.owned_children(), vec![base.id(), exact.id()]);

        refine.train(&random_vectors(100, 4, 7)).unwrap();
        let data = random_vectors(20, 4, 8);
        refine.add(&data).unwrap();
        refine.set_k_factor(4.0).unwrap();
        let results = refine.search(&data[..4], 1).unwrap();
        assert_eq!(results.labels(), &[0]);

        refine.release().unwrap();
        for child in [&quantizer, &base, &exact] {
            assert!(child.is_released());
            child.release().unwrap();
        }
        assert_eq!(engine.calls("free"), 4);
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_refine_dimension_mismatch() {
        let (_engine, runtime) = setup();
        let base = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let exact = Index::flat(&runtime, 8, MetricType::L2).unwrap();
        assert!(matches!(
            Index::refine(&base, &exact),
            Err(Error::InvalidDimension(_))
        ));
    }

    #[test]
    fn test_children_from_other_engine_rejected() {
        let (_engine, runtime) = setup();
        let (_other_engine, other) = setup();
        let base = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let exact = Index::flat(&other, 4, MetricType::L2).unwrap();
        assert!(Index::refine(&base, &exact).is_err());
    }

    #[test]
    fn test_pre_transform() {
        let (engine, runtime) = setup();
        let pca = VectorTransform::pca(&runtime, 8, 4).unwrap();
        let flat = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let mut index = Index::pre_transform(&pca, &flat).unwrap();
        assert_eq!(index.dimension(), 8);
        assert_eq!(pca.owner(), Some(index.id()));

        index.train(&random_vectors(10, 8, 9)).unwrap();
        index.add(&random_vectors(10, 8, 10)).unwrap();
        assert_eq!(index.len(), 10);

        let wrong = Index::flat(&runtime, 3, MetricType::L2).unwrap();
        let pca2 = VectorTransform::pca(&runtime, 8, 4).unwrap();
        assert!(matches!(
            Index::pre_transform(&pca2, &wrong),
            Err(Error::InvalidDimension(_))
        ));

        drop(index);
        assert!(pca.is_released());
        assert!(flat.is_released());
        wrong.release().unwrap();
        pca2.release().unwrap();
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_shards_fan_out() {
        let (engine, runtime) = setup();
        let mut shards = Index::shards(&runtime, 2, MetricType::L2).unwrap();
        let a = Index::flat(&runtime, 2, MetricType::L2).unwrap();
        let b = Index::flat(&runtime, 2, MetricType::L2).unwrap();
        shards.add_shard(&a).unwrap();
        shards.add_shard(&b).unwrap();
        assert!(matches!(
            shards.add_shard(&a),
            Err(Error::OwnershipConflict(_))
        ));

        shards
            .add(&[0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0])
            .unwrap();
        assert_eq!(shards.len(), 4);
        let results = shards.search(&[3.0, 3.0], 2).unwrap();
        assert_eq!(results.labels(), &[3, 2]);

        let mut flat = Index::flat(&runtime, 2, MetricType::L2).unwrap();
        assert!(matches!(
            flat.add_shard(&a),
            Err(Error::UnsupportedOperation { .. })
        ));
        flat.release().unwrap();

        // An index wrapping the shards cannot become one of its shards.
        let mut outer = Index::shards(&runtime, 2, MetricType::L2).unwrap();
        let wrapper = Index::id_map(&outer).unwrap();
        assert!(matches!(
            outer.add_shard(&wrapper),
            Err(Error::OwnershipConflict(_))
        ));
        assert_eq!(wrapper.owner(), None);
        assert!(outer.owned_children().is_empty());
        wrapper.release().unwrap();
        assert!(outer.is_released());

        shards.release().unwrap();
        assert!(a.is_released() && b.is_released());
        assert_eq!(engine.live_objects(), 0);
    }
}
