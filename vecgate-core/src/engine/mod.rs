//! The native engine's C-style function table.
//!
//! [`NativeEngine`] is the complete set of functions the wrapper may call on
//! the external engine. Objects are identified by opaque [`NativeRef`]
//! values, buffers are passed as slices (pointer plus length), and every
//! function reports failure as a raw non-zero [`Status`]. Nothing outside
//! [`crate::gateway`] calls these methods directly.
//!
//! Two implementations ship with the crate:
//!
//! - [`MockEngine`] - an in-process engine with exact search, used by the
//!   tests, benches, and demos. It tracks every allocation and records
//!   double frees and use-after-free as violations.
//! - `FaissEngine` (feature `faiss`) - bindings to the FAISS C API.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metric::MetricType;

pub mod mock;

#[cfg(feature = "faiss")]
pub mod faiss;

pub use mock::{MockEngine, Violation};

#[cfg(feature = "faiss")]
pub use self::faiss::FaissEngine;

/// Opaque, pointer-sized identifier for an object owned by the engine.
pub type NativeRef = usize;

/// The null reference. A handle holding it has been released.
pub const NULL_REF: NativeRef = 0;

/// Raw status returned by a failed native call. Never zero.
pub type Status = i32;

/// Result of a native call.
pub type NativeResult<T> = std::result::Result<T, Status>;

/// Status codes produced by the bundled engines.
pub mod status {
    use super::Status;

    /// The engine raised an exception (bad argument, invariant violation).
    pub const ENGINE_ERROR: Status = -1;
    /// The reference does not name a live object.
    pub const INVALID_REF: Status = -3;
    /// The engine has no entry point for the requested function.
    pub const UNSUPPORTED: Status = -5;
}

/// Which family of free/introspection functions applies to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeClass {
    /// Float vector index.
    Index,
    /// Binary code index.
    BinaryIndex,
    /// Vector transform (PCA, OPQ, rotation).
    Transform,
    /// K-means clustering state.
    Clustering,
}

/// Scalar quantizer encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum QuantizerType {
    /// 8 bits per component.
    #[default]
    EightBit,
    /// 4 bits per component.
    FourBit,
    /// 8 bits, one range shared by all components.
    EightBitUniform,
    /// 4 bits, one range shared by all components.
    FourBitUniform,
    /// Half-precision floats.
    Fp16,
    /// 8-bit direct mapping of integer values.
    EightBitDirect,
    /// 6 bits per component.
    SixBit,
}

impl QuantizerType {
    /// Native enum value passed across the boundary.
    pub fn native_code(self) -> i32 {
        match self {
            QuantizerType::EightBit => 0,
            QuantizerType::FourBit => 1,
            QuantizerType::EightBitUniform => 2,
            QuantizerType::FourBitUniform => 3,
            QuantizerType::Fp16 => 4,
            QuantizerType::EightBitDirect => 5,
            QuantizerType::SixBit => 6,
        }
    }

    /// Returns true if the encoding learns per-component ranges.
    pub fn requires_training(self) -> bool {
        !matches!(self, QuantizerType::Fp16 | QuantizerType::EightBitDirect)
    }
}

/// Runtime facts about a native object, read through introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    /// Runtime type name as the engine reports it, e.g. `IndexIVFFlat`.
    pub type_name: String,
    /// Input dimension (in bits for binary indexes).
    pub dimension: usize,
    pub metric: MetricType,
    pub ntotal: usize,
    pub is_trained: bool,
    /// Cluster count for inverted-file and clustering objects.
    pub nlist: Option<usize>,
    /// Output dimension for transforms.
    pub d_out: Option<usize>,
}

/// The engine's function table.
///
/// Buffer arguments follow the engine's conventions: `x` holds `n * d`
/// floats, search outputs hold `n * k` slots, and binary codes are
/// `d / 8` bytes each. Implementations must not retain any slice past the
/// call.
pub trait NativeEngine: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Sets the engine's process-wide worker thread count.
    fn set_num_threads(&self, threads: usize) -> NativeResult<()>;

    // Construction.

    fn index_flat_new(&self, d: usize, metric: MetricType) -> NativeResult<NativeRef>;
    fn index_ivf_flat_new(
        &self,
        quantizer: NativeRef,
        d: usize,
        nlist: usize,
        metric: MetricType,
    ) -> NativeResult<NativeRef>;
    fn index_ivf_pq_new(
        &self,
        quantizer: NativeRef,
        d: usize,
        nlist: usize,
        m: usize,
        nbits: usize,
        metric: MetricType,
    ) -> NativeResult<NativeRef>;
    fn index_ivf_sq_new(
        &self,
        quantizer: NativeRef,
        d: usize,
        nlist: usize,
        qtype: QuantizerType,
        metric: MetricType,
    ) -> NativeResult<NativeRef>;
    fn index_hnsw_flat_new(&self, d: usize, m: usize, metric: MetricType)
        -> NativeResult<NativeRef>;
    fn index_pq_new(
        &self,
        d: usize,
        m: usize,
        nbits: usize,
        metric: MetricType,
    ) -> NativeResult<NativeRef>;
    fn index_sq_new(
        &self,
        d: usize,
        qtype: QuantizerType,
        metric: MetricType,
    ) -> NativeResult<NativeRef>;
    fn index_lsh_new(
        &self,
        d: usize,
        nbits: usize,
        rotate_data: bool,
        train_thresholds: bool,
    ) -> NativeResult<NativeRef>;
    fn index_idmap_new(&self, base: NativeRef) -> NativeResult<NativeRef>;
    fn index_refine_new(&self, base: NativeRef, refine: NativeRef) -> NativeResult<NativeRef>;
    fn index_pretransform_new(
        &self,
        transform: NativeRef,
        base: NativeRef,
    ) -> NativeResult<NativeRef>;
    fn index_shards_new(&self, d: usize, metric: MetricType) -> NativeResult<NativeRef>;
    fn index_shards_add_shard(&self, shards: NativeRef, shard: NativeRef) -> NativeResult<()>;
    fn index_factory(
        &self,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> NativeResult<NativeRef>;

    fn binary_flat_new(&self, d: usize) -> NativeResult<NativeRef>;
    fn binary_ivf_new(&self, quantizer: NativeRef, d: usize, nlist: usize)
        -> NativeResult<NativeRef>;
    fn binary_hash_new(&self, d: usize, nbits: usize) -> NativeResult<NativeRef>;

    fn pca_matrix_new(
        &self,
        d_in: usize,
        d_out: usize,
        eigen_power: f32,
        random_rotation: bool,
    ) -> NativeResult<NativeRef>;
    fn opq_matrix_new(&self, d: usize, m: usize) -> NativeResult<NativeRef>;
    fn random_rotation_new(&self, d_in: usize, d_out: usize) -> NativeResult<NativeRef>;

    // Mutation.

    fn train(&self, index: NativeRef, n: usize, x: &[f32]) -> NativeResult<()>;
    fn add(&self, index: NativeRef, n: usize, x: &[f32]) -> NativeResult<()>;
    fn add_with_ids(&self, index: NativeRef, n: usize, x: &[f32], ids: &[i64])
        -> NativeResult<()>;
    fn reset(&self, index: NativeRef) -> NativeResult<()>;
    fn set_parameter(&self, index: NativeRef, name: &str, value: f64) -> NativeResult<()>;
    fn get_parameter(&self, index: NativeRef, name: &str) -> NativeResult<f64>;

    // Queries.

    #[allow(clippy::too_many_arguments)]
    fn search(
        &self,
        index: NativeRef,
        n: usize,
        x: &[f32],
        k: usize,
        distances: &mut [f32],
        labels: &mut [i64],
    ) -> NativeResult<()>;
    fn assign(&self, index: NativeRef, n: usize, x: &[f32], labels: &mut [i64])
        -> NativeResult<()>;
    fn reconstruct(&self, index: NativeRef, key: i64, out: &mut [f32]) -> NativeResult<()>;
    fn reconstruct_n(
        &self,
        index: NativeRef,
        start: i64,
        n: usize,
        out: &mut [f32],
    ) -> NativeResult<()>;

    // Range search result protocol.

    /// Allocates an empty result container for `nq` queries.
    fn range_result_new(&self, nq: usize) -> NativeResult<NativeRef>;
    /// Runs a range search, writing into a container from `range_result_new`.
    fn range_search(
        &self,
        index: NativeRef,
        n: usize,
        x: &[f32],
        radius: f32,
        result: NativeRef,
    ) -> NativeResult<()>;
    /// Total number of hits stored in the container (its last offset).
    fn range_result_size(&self, result: NativeRef) -> NativeResult<usize>;
    /// Copies the `nq + 1` offsets, labels, and distances out of the container.
    fn range_result_copy(
        &self,
        result: NativeRef,
        offsets: &mut [usize],
        labels: &mut [i64],
        distances: &mut [f32],
    ) -> NativeResult<()>;
    fn range_result_free(&self, result: NativeRef) -> NativeResult<()>;

    // Binary indexes.

    fn binary_train(&self, index: NativeRef, n: usize, x: &[u8]) -> NativeResult<()>;
    fn binary_add(&self, index: NativeRef, n: usize, x: &[u8]) -> NativeResult<()>;
    fn binary_search(
        &self,
        index: NativeRef,
        n: usize,
        x: &[u8],
        k: usize,
        distances: &mut [i32],
        labels: &mut [i64],
    ) -> NativeResult<()>;
    fn binary_reset(&self, index: NativeRef) -> NativeResult<()>;

    // Transforms.

    fn transform_train(&self, transform: NativeRef, n: usize, x: &[f32]) -> NativeResult<()>;
    fn transform_apply(
        &self,
        transform: NativeRef,
        n: usize,
        x: &[f32],
        out: &mut [f32],
    ) -> NativeResult<()>;
    fn transform_reverse(
        &self,
        transform: NativeRef,
        n: usize,
        xt: &[f32],
        out: &mut [f32],
    ) -> NativeResult<()>;

    // Clustering.

    /// Allocates k-means state for `k` centroids of dimension `d`.
    fn kmeans_new(&self, d: usize, k: usize) -> NativeResult<NativeRef>;
    fn kmeans_set_niter(&self, kmeans: NativeRef, niter: usize) -> NativeResult<()>;
    fn kmeans_set_seed(&self, kmeans: NativeRef, seed: u64) -> NativeResult<()>;
    /// Runs k-means on `n` vectors, replacing any previous centroids.
    fn kmeans_train(&self, kmeans: NativeRef, n: usize, x: &[f32]) -> NativeResult<()>;
    /// Copies the `k * d` centroid components into `out`.
    fn kmeans_centroids(&self, kmeans: NativeRef, out: &mut [f32]) -> NativeResult<()>;
    /// Writes the nearest centroid of each of the `n` vectors into `labels`.
    fn kmeans_assign(
        &self,
        kmeans: NativeRef,
        n: usize,
        x: &[f32],
        labels: &mut [i64],
    ) -> NativeResult<()>;

    // Lifecycle.

    /// Frees a native object. Freeing a composite whose ownership flag is set
    /// also frees its children.
    fn free(&self, class: NativeClass, object: NativeRef) -> NativeResult<()>;
    /// Sets whether `object` frees its children when it is itself freed.
    fn set_own_fields(&self, object: NativeRef, own: bool) -> NativeResult<()>;

    /// Reads the runtime type and scalar state of an object.
    fn describe(&self, class: NativeClass, object: NativeRef) -> NativeResult<ObjectInfo>;

    // Persistence.

    fn write_index(&self, index: NativeRef, path: &Path) -> NativeResult<()>;
    fn read_index(&self, path: &Path) -> NativeResult<NativeRef>;
    fn serialize_index(&self, index: NativeRef) -> NativeResult<Vec<u8>>;
    fn deserialize_index(&self, bytes: &[u8]) -> NativeResult<NativeRef>;
}

/// The engine selected at compile time: FAISS when the `faiss` feature is
/// enabled, the in-process engine otherwise.
pub fn default_engine() -> Arc<dyn NativeEngine> {
    #[cfg(feature = "faiss")]
    {
        Arc::new(FaissEngine::new())
    }
    #[cfg(not(feature = "faiss"))]
    {
        Arc::new(MockEngine::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantizer_codes() {
        assert_eq!(QuantizerType::EightBit.native_code(), 0);
        assert_eq!(QuantizerType::SixBit.native_code(), 6);
        assert!(QuantizerType::FourBit.requires_training());
        assert!(!QuantizerType::Fp16.requires_training());
    }
}
