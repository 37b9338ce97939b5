//! Managed index handles.
//!
//! An [`Index`] wraps one native index. Every operation first checks that
//! the handle has not been released, validates its inputs in managed code,
//! and only then crosses into the engine through the gateway. The handle
//! lock is held for the duration of each native call, so operations on one
//! index are serialized and a concurrent release waits for them to finish.
//!
//! Constructors live in submodules by family: [`concrete`] for standalone
//! indexes, [`composite`] for indexes built over child handles, and
//! [`binary`] for indexes over packed binary codes. Indexes built from a
//! textual description and read from storage are in
//! [`crate::factory`] and [`crate::persistence`].

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{CoreStage, PipelineDescriptor};
use crate::engine::{NativeRef, ObjectInfo};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleId, HandleState, IndexKind};
use crate::metric::MetricType;
use crate::range::{self, RangeSearchResult};
use crate::result::SearchResults;
use crate::runtime::Runtime;
use crate::vectors::VectorBatch;

pub mod binary;
pub mod composite;
pub mod concrete;

/// Tuning parameter names understood by [`Index::set_parameter`].
pub mod params {
    /// Inverted lists probed per query.
    pub const NPROBE: &str = "nprobe";
    /// Graph search breadth.
    pub const EF_SEARCH: &str = "efSearch";
    /// Graph construction breadth.
    pub const EF_CONSTRUCTION: &str = "efConstruction";
    /// Candidate multiplier of a refinement stage.
    pub const K_FACTOR: &str = "k_factor";
}

/// Training vectors required per inverted list.
pub const MIN_POINTS_PER_CENTROID: usize = 30;

/// What an index can do beyond train/add/search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Capabilities {
    pub(crate) nprobe: bool,
    pub(crate) graph: bool,
    pub(crate) k_factor: bool,
    pub(crate) custom_ids: bool,
    pub(crate) reconstruct: bool,
    /// Stored keys are `0..len`, so key ranges can be checked up front.
    pub(crate) positional_keys: bool,
}

impl Capabilities {
    const NONE: Capabilities = Capabilities {
        nprobe: false,
        graph: false,
        k_factor: false,
        custom_ids: false,
        reconstruct: false,
        positional_keys: false,
    };

    /// Native structure unknown: let the engine decide.
    const OPAQUE: Capabilities = Capabilities {
        nprobe: true,
        graph: true,
        k_factor: true,
        custom_ids: true,
        reconstruct: true,
        positional_keys: false,
    };

    pub(crate) fn of_kind(kind: IndexKind) -> Self {
        let exact = Capabilities {
            reconstruct: true,
            positional_keys: true,
            ..Self::NONE
        };
        match kind {
            IndexKind::Flat | IndexKind::ProductQuantized | IndexKind::ScalarQuantized => exact,
            IndexKind::Graph => Capabilities {
                graph: true,
                ..exact
            },
            IndexKind::LocalitySensitiveHash => Capabilities {
                positional_keys: true,
                ..Self::NONE
            },
            IndexKind::InvertedFile => Capabilities {
                nprobe: true,
                custom_ids: true,
                reconstruct: true,
                ..Self::NONE
            },
            IndexKind::Binary => Self::NONE,
            IndexKind::Shards => Capabilities {
                custom_ids: false,
                reconstruct: false,
                ..Self::OPAQUE
            },
            IndexKind::IdMap | IndexKind::Refine | IndexKind::PreTransform | IndexKind::Generic => {
                Self::OPAQUE
            }
        }
    }

    pub(crate) fn of_pipeline(pipeline: &PipelineDescriptor) -> Self {
        let nprobe = pipeline.nlist().is_some();
        let custom_ids = pipeline.has_id_map() || nprobe;
        Capabilities {
            nprobe,
            graph: pipeline.hnsw_m().is_some(),
            k_factor: pipeline.has_refinement(),
            custom_ids,
            reconstruct: !matches!(pipeline.core(), CoreStage::Lsh),
            positional_keys: !custom_ids && pipeline.transforms().is_empty(),
        }
    }
}

/// A managed native index.
pub struct Index {
    handle: Arc<Handle>,
    runtime: Runtime,
    kind: IndexKind,
    dimension: usize,
    metric: MetricType,
    nlist: Option<usize>,
    caps: Capabilities,
    pipeline: Option<PipelineDescriptor>,
    description: Option<String>,
}

impl Index {
    /// Wraps a freshly constructed native index, reading its scalar state.
    /// The native object is freed if it cannot be described.
    pub(crate) fn from_native(runtime: &Runtime, kind: IndexKind, native: NativeRef) -> Result<Self> {
        let gateway = runtime.gateway();
        let class = kind.class();
        let info = match gateway.describe(class, native) {
            Ok(info) => info,
            Err(e) => {
                let _ = gateway.free(class, native);
                return Err(e);
            }
        };
        Ok(Self::from_described(runtime, kind, native, info))
    }

    /// Wraps a native index whose state has already been read.
    pub(crate) fn from_described(
        runtime: &Runtime,
        kind: IndexKind,
        native: NativeRef,
        info: ObjectInfo,
    ) -> Self {
        let gateway = runtime.gateway();
        let handle = Handle::new(gateway.clone(), kind.class(), native, info.ntotal, info.is_trained);
        debug!(
            handle = %handle.id(),
            ?kind,
            type_name = %info.type_name,
            dimension = info.dimension,
            "index constructed"
        );
        Self {
            handle,
            runtime: runtime.clone(),
            kind,
            dimension: info.dimension,
            metric: info.metric,
            nlist: info.nlist,
            caps: Capabilities::of_kind(kind),
            pipeline: None,
            description: None,
        }
    }

    pub(crate) fn from_handle(
        runtime: &Runtime,
        handle: Arc<Handle>,
        kind: IndexKind,
        dimension: usize,
        metric: MetricType,
    ) -> Self {
        debug!(handle = %handle.id(), ?kind, dimension, "composite constructed");
        Self {
            handle,
            runtime: runtime.clone(),
            kind,
            dimension,
            metric,
            nlist: None,
            caps: Capabilities::of_kind(kind),
            pipeline: None,
            description: None,
        }
    }

    pub(crate) fn with_nlist(mut self, nlist: Option<usize>) -> Self {
        self.nlist = nlist;
        self
    }

    pub(crate) fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    pub(crate) fn with_pipeline(mut self, description: String, pipeline: Option<PipelineDescriptor>) -> Self {
        if let Some(p) = &pipeline {
            self.caps = Capabilities::of_pipeline(p);
            self.nlist = self.nlist.or(p.nlist());
        }
        self.description = Some(description);
        self.pipeline = pipeline;
        self
    }

    pub(crate) fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        self.caps
    }

    // Accessors.

    pub fn id(&self) -> HandleId {
        self.handle.id()
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Vector dimension (in bits for binary indexes).
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> MetricType {
        self.metric
    }

    /// Number of stored vectors, as last observed through this handle.
    pub fn len(&self) -> usize {
        self.handle.lock().element_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_trained(&self) -> bool {
        self.handle.lock().is_trained
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    /// Cluster count, for inverted-file indexes and composites over one.
    pub fn nlist(&self) -> Option<usize> {
        self.nlist
    }

    /// The composite that owns this index, if any.
    pub fn owner(&self) -> Option<HandleId> {
        self.handle.owner()
    }

    /// Number of live composites borrowing this index.
    pub fn borrowers(&self) -> usize {
        self.handle.borrowers()
    }

    /// Children this composite releases with itself.
    pub fn owned_children(&self) -> Vec<HandleId> {
        self.handle.owned_children()
    }

    /// Children this composite uses but does not release.
    pub fn referenced_children(&self) -> Vec<HandleId> {
        self.handle.referenced_children()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The description a generic index was built from.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The parsed pipeline of a generic index, when its description is in
    /// the subset the managed parser understands.
    pub fn pipeline(&self) -> Option<&PipelineDescriptor> {
        self.pipeline.as_ref()
    }

    fn require_float(&self, operation: &'static str) -> Result<()> {
        if self.kind == IndexKind::Binary {
            return Err(Error::UnsupportedOperation {
                operation,
                kind: self.kind,
            });
        }
        Ok(())
    }

    fn require_reconstruct(&self) -> Result<()> {
        if !self.caps.reconstruct {
            return Err(Error::UnsupportedOperation {
                operation: "reconstruct",
                kind: self.kind,
            });
        }
        Ok(())
    }

    fn check_training_size(&self, n: usize) -> Result<()> {
        if let Some(nlist) = self.nlist {
            let need = nlist.saturating_mul(MIN_POINTS_PER_CENTROID);
            if n < need {
                return Err(Error::InsufficientTrainingData { have: n, need });
            }
        }
        Ok(())
    }

    fn check_key(&self, key: i64, len: usize) -> Result<()> {
        let valid = usize::try_from(key).is_ok_and(|k| !self.caps.positional_keys || k < len);
        if valid {
            Ok(())
        } else {
            Err(Error::KeyOutOfRange { key, len })
        }
    }

    // Lifecycle.

    /// Releases the native index. Idempotent.
    ///
    /// A composite releases the children it owns along with itself.
    ///
    /// # Errors
    ///
    /// [`Error::OwnershipConflict`] if a live composite owns this index, and
    /// [`Error::NativeFailure`] if the engine fails to free it. The handle is
    /// marked released either way.
    pub fn release(&self) -> Result<()> {
        self.handle.release()
    }

    /// Re-reads the element count and trained flag from the engine.
    ///
    /// Operations through a composite do not update the cached state of its
    /// children; refreshing a child brings it back in sync.
    pub fn refresh(&mut self) -> Result<()> {
        let mut state = self.handle.live()?;
        let info = self
            .runtime
            .gateway()
            .describe(self.handle.class(), state.native_ref)?;
        state.element_count = info.ntotal;
        state.is_trained = info.is_trained;
        Ok(())
    }

    // Mutation.

    /// Trains the index on `vectors` (`n * dimension` floats).
    ///
    /// Training an already trained index is a no-op, as is an empty buffer.
    ///
    /// # Errors
    ///
    /// - [`Error::ReleasedHandle`] after release
    /// - [`Error::InvalidVectorLength`] for a ragged buffer
    /// - [`Error::InsufficientTrainingData`] for fewer than
    ///   [`MIN_POINTS_PER_CENTROID`] vectors per inverted list
    pub fn train(&mut self, vectors: &[f32]) -> Result<()> {
        let mut state = self.handle.live()?;
        self.require_float("train")?;
        let batch = VectorBatch::new(vectors, self.dimension)?;
        if batch.is_empty() {
            return Ok(());
        }
        if state.is_trained {
            debug!(handle = %self.handle.id(), "already trained, skipping");
            return Ok(());
        }
        self.check_training_size(batch.len())?;

        let index = state.native_ref;
        let gateway = self.runtime.gateway();
        self.runtime
            .run_batch(batch.len(), || gateway.train(index, batch))?;
        state.is_trained = true;
        Ok(())
    }

    /// Adds `vectors`; they receive sequential labels starting at
    /// [`len`](Self::len).
    ///
    /// Batches larger than the configured add batch size are split. If a
    /// sub-batch fails, the sub-batches before it stay added and
    /// [`len`](Self::len) reflects them.
    ///
    /// # Example
    ///
    /// ```
    /// use vecgate_core::{Index, MetricType, Runtime};
    ///
    /// let runtime = Runtime::mock().unwrap();
    /// let mut index = Index::flat(&runtime, 2, MetricType::L2).unwrap();
    /// index.add(&[0.0, 0.0, 1.0, 1.0]).unwrap();
    /// assert_eq!(index.len(), 2);
    /// ```
    pub fn add(&mut self, vectors: &[f32]) -> Result<()> {
        let mut state = self.handle.live()?;
        self.require_float("add")?;
        let batch = VectorBatch::new(vectors, self.dimension)?;
        if batch.is_empty() {
            return Ok(());
        }
        if !state.is_trained {
            return Err(Error::NotTrained);
        }
        // Id maps only accept explicit ids natively.
        let id_mapped = self.kind == IndexKind::IdMap
            || self.pipeline.as_ref().is_some_and(|p| p.has_id_map());
        if id_mapped {
            let start = state.element_count as i64;
            let ids: Vec<i64> = (start..start + batch.len() as i64).collect();
            return self.add_batched(&mut state, batch, Some(&ids));
        }
        self.add_batched(&mut state, batch, None)
    }

    /// Adds `vectors` under caller-chosen labels.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidIds`] unless there is exactly one id per vector, and
    /// [`Error::UnsupportedOperation`] for kinds that number vectors
    /// themselves.
    pub fn add_with_ids(&mut self, vectors: &[f32], ids: &[i64]) -> Result<()> {
        let mut state = self.handle.live()?;
        self.require_float("add_with_ids")?;
        let batch = VectorBatch::new(vectors, self.dimension)?;
        if !self.caps.custom_ids {
            return Err(Error::UnsupportedOperation {
                operation: "add_with_ids",
                kind: self.kind,
            });
        }
        if ids.len() != batch.len() {
            return Err(Error::InvalidIds {
                ids: ids.len(),
                vectors: batch.len(),
            });
        }
        if batch.is_empty() {
            return Ok(());
        }
        if !state.is_trained {
            return Err(Error::NotTrained);
        }
        self.add_batched(&mut state, batch, Some(ids))
    }

    fn add_batched(
        &self,
        state: &mut HandleState,
        batch: VectorBatch<'_>,
        ids: Option<&[i64]>,
    ) -> Result<()> {
        let index = state.native_ref;
        let chunk = self.runtime.config().batch.add_batch_size;
        let gateway = self.runtime.gateway();
        self.runtime.run_batch(batch.len(), || {
            let mut done = 0;
            for sub in batch.chunks(chunk) {
                match ids {
                    Some(ids) => gateway.add_with_ids(index, sub, &ids[done..done + sub.len()])?,
                    None => gateway.add(index, sub)?,
                }
                done += sub.len();
                state.element_count += sub.len();
            }
            Ok(())
        })
    }

    /// Removes every stored vector. Training is kept.
    pub fn reset(&mut self) -> Result<()> {
        let mut state = self.handle.live()?;
        self.runtime
            .gateway()
            .reset(self.handle.class(), state.native_ref)?;
        state.element_count = 0;
        Ok(())
    }

    // Queries.

    /// Finds the `k` nearest stored vectors for each query.
    ///
    /// Distances are as the engine reports them: squared for L2, raw dot
    /// products for inner product. Rows with fewer than `k` stored vectors
    /// are padded with label `-1`.
    ///
    /// # Errors
    ///
    /// - [`Error::ReleasedHandle`] after release
    /// - [`Error::InvalidK`] for `k == 0`
    /// - [`Error::InvalidVectorLength`] for a ragged buffer
    /// - [`Error::NotTrained`] before training
    pub fn search(&self, queries: &[f32], k: usize) -> Result<SearchResults> {
        let state = self.handle.live()?;
        self.require_float("search")?;
        if k == 0 {
            return Err(Error::InvalidK(k));
        }
        let batch = VectorBatch::new(queries, self.dimension)?;
        if batch.is_empty() {
            return Ok(SearchResults::empty(k));
        }
        if !state.is_trained {
            return Err(Error::NotTrained);
        }

        let nq = batch.len();
        let mut distances = vec![0.0f32; nq * k];
        let mut labels = vec![-1i64; nq * k];
        let index = state.native_ref;
        let chunk = self.runtime.config().batch.search_batch_size;
        let gateway = self.runtime.gateway();
        self.runtime.run_batch(nq, || {
            let windows = distances
                .chunks_mut(chunk * k)
                .zip(labels.chunks_mut(chunk * k));
            for (sub, (d, l)) in batch.chunks(chunk).zip(windows) {
                gateway.search(index, sub, k, d, l)?;
            }
            Ok::<_, Error>(())
        })?;
        Ok(SearchResults::new(nq, k, distances, labels))
    }

    /// Finds every stored vector within `radius` of each query: squared
    /// distance below `radius` for L2, similarity above it for inner product.
    pub fn range_search(&self, queries: &[f32], radius: f32) -> Result<RangeSearchResult> {
        let state = self.handle.live()?;
        self.require_float("range_search")?;
        if radius.is_nan() {
            return Err(Error::InvalidParameter("radius is NaN".to_string()));
        }
        let batch = VectorBatch::new(queries, self.dimension)?;
        if !batch.is_empty() && !state.is_trained {
            return Err(Error::NotTrained);
        }
        let index = state.native_ref;
        let chunk = self.runtime.config().batch.search_batch_size;
        let gateway = self.runtime.gateway();
        self.runtime.run_batch(batch.len(), || {
            let mut merged = RangeSearchResult::empty();
            for sub in batch.chunks(chunk) {
                merged.append(range::range_search(gateway, index, sub, radius)?);
            }
            Ok(merged)
        })
    }

    /// Label of the nearest stored vector for each input vector.
    pub fn assign(&self, vectors: &[f32]) -> Result<Vec<i64>> {
        let state = self.handle.live()?;
        self.require_float("assign")?;
        let batch = VectorBatch::new(vectors, self.dimension)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if !state.is_trained {
            return Err(Error::NotTrained);
        }
        let index = state.native_ref;
        let chunk = self.runtime.config().batch.search_batch_size;
        let gateway = self.runtime.gateway();
        self.runtime.run_batch(batch.len(), || {
            let mut labels = Vec::with_capacity(batch.len());
            for sub in batch.chunks(chunk) {
                labels.extend(gateway.assign(index, sub)?);
            }
            Ok(labels)
        })
    }

    /// Returns the stored vector with label `key`.
    ///
    /// Lossy indexes return their decoded approximation.
    pub fn reconstruct(&self, key: i64) -> Result<Vec<f32>> {
        let state = self.handle.live()?;
        self.require_reconstruct()?;
        self.check_key(key, state.element_count)?;
        let index = state.native_ref;
        let mut out = vec![0.0; self.dimension];
        self.runtime
            .gateway()
            .call("reconstruct", |e| e.reconstruct(index, key, &mut out))?;
        Ok(out)
    }

    /// Returns `n` consecutive stored vectors starting at label `start`,
    /// flattened.
    pub fn reconstruct_n(&self, start: i64, n: usize) -> Result<Vec<f32>> {
        let state = self.handle.live()?;
        self.require_reconstruct()?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let last = i64::try_from(n - 1)
            .ok()
            .and_then(|offset| start.checked_add(offset))
            .ok_or(Error::KeyOutOfRange {
                key: start,
                len: state.element_count,
            })?;
        self.check_key(start, state.element_count)?;
        self.check_key(last, state.element_count)?;

        let index = state.native_ref;
        let mut out = vec![0.0; n * self.dimension];
        self.runtime
            .gateway()
            .call("reconstruct_n", |e| e.reconstruct_n(index, start, n, &mut out))?;
        Ok(out)
    }

    /// Returns the stored vectors for `keys`, flattened in key order.
    pub fn reconstruct_batch(&self, keys: &[i64]) -> Result<Vec<f32>> {
        let state = self.handle.live()?;
        self.require_reconstruct()?;
        for &key in keys {
            self.check_key(key, state.element_count)?;
        }
        let index = state.native_ref;
        let gateway = self.runtime.gateway();
        let mut out = vec![0.0; keys.len() * self.dimension];
        for (&key, row) in keys.iter().zip(out.chunks_exact_mut(self.dimension)) {
            gateway.call("reconstruct", |e| e.reconstruct(index, key, row))?;
        }
        Ok(out)
    }

    // Parameters.

    fn resolve_parameter(&self, name: &str) -> Result<&'static str> {
        let (param, supported) = match name {
            params::NPROBE => (params::NPROBE, self.caps.nprobe),
            params::EF_SEARCH => (params::EF_SEARCH, self.caps.graph),
            params::EF_CONSTRUCTION => (params::EF_CONSTRUCTION, self.caps.graph),
            params::K_FACTOR => (params::K_FACTOR, self.caps.k_factor),
            other => {
                return Err(Error::InvalidParameter(format!(
                    "unknown parameter '{}'",
                    other
                )))
            }
        };
        if !supported {
            return Err(Error::UnsupportedOperation {
                operation: param,
                kind: self.kind,
            });
        }
        Ok(param)
    }

    fn check_parameter(&self, name: &str, value: f64) -> Result<&'static str> {
        let param = self.resolve_parameter(name)?;
        let integral = value >= 1.0 && value.fract() == 0.0;
        let valid = match param {
            params::NPROBE => integral && self.nlist.map_or(true, |nlist| value <= nlist as f64),
            params::K_FACTOR => value >= 1.0 && value.is_finite(),
            _ => integral,
        };
        if !valid {
            let range = match (param, self.nlist) {
                (params::NPROBE, Some(nlist)) => format!("an integer in 1..={}", nlist),
                (params::K_FACTOR, _) => "at least 1.0".to_string(),
                _ => "a positive integer".to_string(),
            };
            return Err(Error::InvalidParameter(format!(
                "{} must be {}, got {}",
                param, range, value
            )));
        }
        Ok(param)
    }

    /// Sets a search-time or construction-time tuning parameter.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for an unknown name or out-of-range value,
    /// [`Error::UnsupportedOperation`] when the parameter does not apply to
    /// this kind of index.
    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        let state = self.handle.live()?;
        let param = self.check_parameter(name, value)?;
        let index = state.native_ref;
        self.runtime
            .gateway()
            .call("set_parameter", |e| e.set_parameter(index, param, value))?;
        debug!(handle = %self.handle.id(), parameter = param, value, "parameter set");
        Ok(())
    }

    /// Reads a tuning parameter.
    pub fn get_parameter(&self, name: &str) -> Result<f64> {
        let state = self.handle.live()?;
        let param = self.resolve_parameter(name)?;
        let index = state.native_ref;
        self.runtime
            .gateway()
            .call("get_parameter", |e| e.get_parameter(index, param))
    }

    pub fn set_nprobe(&mut self, nprobe: usize) -> Result<()> {
        self.set_parameter(params::NPROBE, nprobe as f64)
    }

    pub fn set_ef_search(&mut self, ef: usize) -> Result<()> {
        self.set_parameter(params::EF_SEARCH, ef as f64)
    }

    pub fn set_ef_construction(&mut self, ef: usize) -> Result<()> {
        self.set_parameter(params::EF_CONSTRUCTION, ef as f64)
    }

    pub fn set_k_factor(&mut self, k_factor: f32) -> Result<()> {
        self.set_parameter(params::K_FACTOR, f64::from(k_factor))
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.handle.lock();
        f.debug_struct("Index")
            .field("id", &self.handle.id())
            .field("kind", &self.kind)
            .field("dimension", &self.dimension)
            .field("metric", &self.metric)
            .field("len", &state.element_count)
            .field("trained", &state.is_trained)
            .field("native_ref", &state.native_ref)
            .finish()
    }
}
