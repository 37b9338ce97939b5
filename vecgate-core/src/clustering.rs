//! Standalone k-means clustering.
//!
//! [`Kmeans`] wraps the engine's clustering object. It is not an index and
//! cannot be adopted by a composite, but it follows the same release
//! contract: explicit [`release`](Kmeans::release) is idempotent, dropping
//! an unreleased handle frees the native state, and every operation on a
//! released handle fails with [`Error::ReleasedHandle`].

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::engine::{NativeClass, NativeRef};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleId};
use crate::metrics::{Operation, Timer};
use crate::runtime::Runtime;
use crate::vectors::VectorBatch;

/// Lloyd iterations run by a fresh clustering object.
pub const DEFAULT_NITER: usize = 25;

/// A managed native k-means clustering.
///
/// # Example
///
/// ```
/// use vecgate_core::{Kmeans, Runtime};
///
/// let runtime = Runtime::mock().unwrap();
/// let mut kmeans = Kmeans::new(&runtime, 2, 2).unwrap();
/// kmeans
///     .train(&[0.0, 0.0, 0.0, 1.0, 10.0, 10.0, 10.0, 11.0])
///     .unwrap();
///
/// let labels = kmeans.assign(&[0.0, 0.5, 10.0, 10.5]).unwrap();
/// assert_ne!(labels[0], labels[1]);
/// assert_eq!(kmeans.centroids().unwrap().len(), 4);
/// ```
pub struct Kmeans {
    handle: Arc<Handle>,
    runtime: Runtime,
    d: usize,
    k: usize,
    niter: usize,
}

impl Kmeans {
    /// Clustering of `d`-dimensional vectors into `k` centroids.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDimension`] for `d == 0` and
    /// [`Error::InvalidParameter`] for `k == 0`, both before crossing.
    pub fn new(runtime: &Runtime, d: usize, k: usize) -> Result<Self> {
        if d == 0 {
            return Err(Error::InvalidDimension(
                "dimension must be positive".to_string(),
            ));
        }
        if k == 0 {
            return Err(Error::InvalidParameter(
                "cluster count must be positive".to_string(),
            ));
        }
        let gateway = runtime.gateway();
        let native = gateway.call("kmeans_new", |e| e.kmeans_new(d, k))?;
        let info = match gateway.describe(NativeClass::Clustering, native) {
            Ok(info) => info,
            Err(e) => {
                let _ = gateway.free(NativeClass::Clustering, native);
                return Err(e);
            }
        };
        let handle = Handle::new(gateway.clone(), NativeClass::Clustering, native, 0, info.is_trained);
        debug!(handle = %handle.id(), d, k, "kmeans constructed");
        Ok(Self {
            handle,
            runtime: runtime.clone(),
            d,
            k,
            niter: DEFAULT_NITER,
        })
    }

    pub fn id(&self) -> HandleId {
        self.handle.id()
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    /// Number of centroids.
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn niter(&self) -> usize {
        self.niter
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn is_trained(&self) -> bool {
        self.handle.lock().is_trained
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    /// Frees the native clustering state. Idempotent.
    pub fn release(&self) -> Result<()> {
        self.handle.release()
    }

    fn live_ref(&self) -> Result<NativeRef> {
        Ok(self.handle.live()?.native_ref)
    }

    /// Sets the Lloyd iteration count used by later training.
    pub fn set_niter(&mut self, niter: usize) -> Result<()> {
        let state = self.handle.live()?;
        if niter == 0 {
            return Err(Error::InvalidParameter(
                "niter must be positive".to_string(),
            ));
        }
        let native = state.native_ref;
        self.runtime
            .gateway()
            .call("kmeans_set_niter", |e| e.kmeans_set_niter(native, niter))?;
        self.niter = niter;
        Ok(())
    }

    /// Sets the seed that picks the initial centroids.
    pub fn set_seed(&mut self, seed: u64) -> Result<()> {
        let native = self.live_ref()?;
        self.runtime
            .gateway()
            .call("kmeans_set_seed", |e| e.kmeans_set_seed(native, seed))
    }

    /// Clusters `vectors`. Training again replaces the centroids.
    ///
    /// # Errors
    ///
    /// [`Error::InsufficientTrainingData`] for fewer vectors than centroids.
    pub fn train(&mut self, vectors: &[f32]) -> Result<()> {
        let mut state = self.handle.live()?;
        let batch = VectorBatch::new(vectors, self.d)?;
        if batch.len() < self.k {
            return Err(Error::InsufficientTrainingData {
                have: batch.len(),
                need: self.k,
            });
        }
        let native = state.native_ref;
        let gateway = self.runtime.gateway();
        self.runtime.run_batch(batch.len(), || {
            let timer = Timer::start();
            gateway.call("kmeans_train", |e| {
                e.kmeans_train(native, batch.len(), batch.as_slice())
            })?;
            timer.record(Operation::Train, batch.len());
            Ok::<_, Error>(())
        })?;
        state.is_trained = true;
        debug!(handle = %self.handle.id(), n = batch.len(), k = self.k, "kmeans trained");
        Ok(())
    }

    /// The `k * dimension` centroid components, row-major.
    pub fn centroids(&self) -> Result<Vec<f32>> {
        let state = self.handle.live()?;
        if !state.is_trained {
            return Err(Error::NotTrained);
        }
        let native = state.native_ref;
        let mut out = vec![0.0; self.k * self.d];
        self.runtime
            .gateway()
            .call("kmeans_centroids", |e| e.kmeans_centroids(native, &mut out))?;
        Ok(out)
    }

    /// Index in `0..k` of the nearest centroid for each vector.
    ///
    /// Batches larger than the configured search batch size are split.
    pub fn assign(&self, vectors: &[f32]) -> Result<Vec<i64>> {
        let state = self.handle.live()?;
        let batch = VectorBatch::new(vectors, self.d)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if !state.is_trained {
            return Err(Error::NotTrained);
        }
        let native = state.native_ref;
        let chunk = self.runtime.config().batch.search_batch_size;
        let gateway = self.runtime.gateway();
        self.runtime.run_batch(batch.len(), || {
            let mut labels = vec![-1i64; batch.len()];
            for (sub, out) in batch.chunks(chunk).zip(labels.chunks_mut(chunk.max(1))) {
                gateway.call("kmeans_assign", |e| {
                    e.kmeans_assign(native, sub.len(), sub.as_slice(), out)
                })?;
            }
            Ok(labels)
        })
    }
}

impl fmt::Debug for Kmeans {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kmeans")
            .field("id", &self.handle.id())
            .field("d", &self.d)
            .field("k", &self.k)
            .field("niter", &self.niter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::config::EngineConfig;
    use crate::engine::MockEngine;

    fn runtime_with(batch: BatchConfig) -> (Arc<MockEngine>, Runtime) {
        let engine = Arc::new(MockEngine::new());
        let runtime =
            Runtime::new(engine.clone(), EngineConfig::new().with_batch(batch)).unwrap();
        (engine, runtime)
    }

    fn setup() -> (Arc<MockEngine>, Runtime) {
        runtime_with(BatchConfig::default())
    }

    /// Two tight blobs around (0, 0) and (10, 10).
    fn blobs() -> Vec<f32> {
        vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 10.0, 10.0, 10.0, 11.0, 11.0, 10.0]
    }

    #[test]
    fn test_train_and_assign() {
        let (_engine, runtime) = setup();
        let mut kmeans = Kmeans::new(&runtime, 2, 2).unwrap();
        assert_eq!((kmeans.dimension(), kmeans.k()), (2, 2));
        assert!(matches!(kmeans.centroids(), Err(Error::NotTrained)));
        assert!(matches!(kmeans.assign(&[0.0, 0.0]), Err(Error::NotTrained)));

        kmeans.train(&blobs()).unwrap();
        assert!(kmeans.is_trained());

        let labels = kmeans.assign(&[0.5, 0.5, 10.5, 10.5, 0.0, 0.2]).unwrap();
        assert_eq!(labels.len(), 3);
        assert_ne!(labels[0], labels[1]);
        assert_eq!(labels[0], labels[2]);
        assert!(labels.iter().all(|&l| (0..2).contains(&l)));

        let centroids = kmeans.centroids().unwrap();
        let mut rows: Vec<(f32, f32)> = centroids
            .chunks_exact(2)
            .map(|c| (c[0], c[1]))
            .collect();
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));
        let third = 1.0 / 3.0;
        assert!((rows[0].0 - third).abs() < 1e-5 && (rows[0].1 - third).abs() < 1e-5);
        assert!((rows[1].0 - (10.0 + third)).abs() < 1e-5);
    }

    #[test]
    fn test_validation_before_crossing() {
        let (engine, runtime) = setup();
        assert!(matches!(
            Kmeans::new(&runtime, 0, 2),
            Err(Error::InvalidDimension(_))
        ));
        assert!(matches!(
            Kmeans::new(&runtime, 2, 0),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(engine.total_calls(), 0);

        let mut kmeans = Kmeans::new(&runtime, 2, 4).unwrap();
        engine.reset_calls();
        assert!(matches!(
            kmeans.train(&[1.0; 5]),
            Err(Error::InvalidVectorLength { len: 5, dimension: 2 })
        ));
        assert!(matches!(
            kmeans.train(&[1.0; 6]),
            Err(Error::InsufficientTrainingData { have: 3, need: 4 })
        ));
        assert!(matches!(kmeans.set_niter(0), Err(Error::InvalidParameter(_))));
        assert_eq!(engine.total_calls(), 0);
    }

    #[test]
    fn test_parameters_reach_engine() {
        let (engine, runtime) = setup();
        let mut kmeans = Kmeans::new(&runtime, 2, 2).unwrap();
        assert_eq!(kmeans.niter(), DEFAULT_NITER);
        kmeans.set_niter(5).unwrap();
        kmeans.set_seed(7).unwrap();
        assert_eq!(kmeans.niter(), 5);
        assert_eq!(engine.calls("kmeans_set_niter"), 1);
        assert_eq!(engine.calls("kmeans_set_seed"), 1);

        kmeans.train(&blobs()).unwrap();
        kmeans.train(&blobs()).unwrap();
        assert_eq!(engine.calls("kmeans_train"), 2);
    }

    #[test]
    fn test_assign_split_into_sub_batches() {
        let (engine, runtime) = runtime_with(BatchConfig::default().with_search_batch_size(2));
        let mut kmeans = Kmeans::new(&runtime, 2, 2).unwrap();
        kmeans.train(&blobs()).unwrap();

        let labels = kmeans.assign(&blobs()).unwrap();
        assert_eq!(engine.calls("kmeans_assign"), 3);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_release_contract() {
        let (engine, runtime) = setup();
        let mut kmeans = Kmeans::new(&runtime, 2, 2).unwrap();
        kmeans.release().unwrap();
        kmeans.release().unwrap();
        assert!(kmeans.is_released());
        assert!(matches!(kmeans.train(&blobs()), Err(Error::ReleasedHandle)));
        assert!(matches!(kmeans.assign(&[0.0, 0.0]), Err(Error::ReleasedHandle)));
        assert!(matches!(kmeans.set_seed(1), Err(Error::ReleasedHandle)));
        assert_eq!(engine.calls("free"), 1);
        assert!(engine.violations().is_empty());

        let dropped = Kmeans::new(&runtime, 2, 2).unwrap();
        assert_eq!(engine.live_objects(), 1);
        drop(dropped);
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_engine_failure_keeps_untrained() {
        let (engine, runtime) = setup();
        let mut kmeans = Kmeans::new(&runtime, 2, 2).unwrap();
        engine.fail_next("kmeans_train", -2);
        let err = kmeans.train(&blobs()).unwrap_err();
        assert_eq!(err.native_code(), Some(-2));
        assert!(!kmeans.is_trained());
    }
}
