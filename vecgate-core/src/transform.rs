//! Vector transforms applied ahead of an index.
//!
//! A [`VectorTransform`] follows the same release contract as an index
//! handle, and can be owned by a pre-transform composite
//! ([`Index::pre_transform`](crate::Index::pre_transform)).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{NativeClass, NativeRef};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleId};
use crate::runtime::Runtime;
use crate::vectors::VectorBatch;

/// Transform families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformKind {
    /// Principal component analysis.
    Pca,
    /// Rotation optimized for product quantization.
    Opq,
    RandomRotation,
}

/// A managed native vector transform.
pub struct VectorTransform {
    handle: Arc<Handle>,
    runtime: Runtime,
    kind: TransformKind,
    d_in: usize,
    d_out: usize,
}

impl VectorTransform {
    fn from_native(runtime: &Runtime, kind: TransformKind, native: NativeRef) -> Result<Self> {
        let gateway = runtime.gateway();
        let info = match gateway.describe(NativeClass::Transform, native) {
            Ok(info) => info,
            Err(e) => {
                let _ = gateway.free(NativeClass::Transform, native);
                return Err(e);
            }
        };
        let d_out = info.d_out.unwrap_or(info.dimension);
        let handle = Handle::new(gateway.clone(), NativeClass::Transform, native, 0, info.is_trained);
        debug!(handle = %handle.id(), ?kind, d_in = info.dimension, d_out, "transform constructed");
        Ok(Self {
            handle,
            runtime: runtime.clone(),
            kind,
            d_in: info.dimension,
            d_out,
        })
    }

    /// PCA from `d_in` down to `d_out` components.
    pub fn pca(runtime: &Runtime, d_in: usize, d_out: usize) -> Result<Self> {
        Self::pca_with(runtime, d_in, d_out, 0.0, false)
    }

    /// PCA with whitening exponent `eigen_power` (0 keeps variances, -0.5
    /// whitens) and an optional random rotation of the output.
    pub fn pca_with(
        runtime: &Runtime,
        d_in: usize,
        d_out: usize,
        eigen_power: f32,
        random_rotation: bool,
    ) -> Result<Self> {
        if d_out == 0 || d_out > d_in {
            return Err(Error::InvalidDimension(format!(
                "PCA output dimension must be in 1..={}, got {}",
                d_in, d_out
            )));
        }
        let native = runtime.gateway().call("pca_matrix_new", |e| {
            e.pca_matrix_new(d_in, d_out, eigen_power, random_rotation)
        })?;
        Self::from_native(runtime, TransformKind::Pca, native)
    }

    /// OPQ rotation of `d` dimensions for `m` sub-quantizers.
    pub fn opq(runtime: &Runtime, d: usize, m: usize) -> Result<Self> {
        if d == 0 || m == 0 || d % m != 0 {
            return Err(Error::InvalidParameter(format!(
                "dimension {} is not divisible into {} sub-quantizers",
                d, m
            )));
        }
        let native = runtime
            .gateway()
            .call("opq_matrix_new", |e| e.opq_matrix_new(d, m))?;
        Self::from_native(runtime, TransformKind::Opq, native)
    }

    /// Random orthogonal rotation from `d_in` to `d_out` dimensions.
    pub fn random_rotation(runtime: &Runtime, d_in: usize, d_out: usize) -> Result<Self> {
        if d_in == 0 || d_out == 0 {
            return Err(Error::InvalidDimension(
                "rotation dimensions must be positive".to_string(),
            ));
        }
        let native = runtime
            .gateway()
            .call("random_rotation_new", |e| e.random_rotation_new(d_in, d_out))?;
        Self::from_native(runtime, TransformKind::RandomRotation, native)
    }

    pub(crate) fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    pub fn id(&self) -> HandleId {
        self.handle.id()
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn d_in(&self) -> usize {
        self.d_in
    }

    pub fn d_out(&self) -> usize {
        self.d_out
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

    /// The pre-transform composite that owns this transform, if any.
    pub fn owner(&self) -> Option<HandleId> {
        self.handle.owner()
    }

    /// Releases the native transform. Idempotent; fails with
    /// [`Error::OwnershipConflict`] while a composite owns it.
    pub fn release(&self) -> Result<()> {
        self.handle.release()
    }

    /// Learns the transform from `d_in`-dimensional vectors. A no-op once
    /// trained.
    pub fn train(&mut self, vectors: &[f32]) -> Result<()> {
        let mut state = self.handle.live()?;
        let batch = VectorBatch::new(vectors, self.d_in)?;
        if batch.is_empty() || state.is_trained {
            return Ok(());
        }
        let native = state.native_ref;
        self.runtime.gateway().call("transform_train", |e| {
            e.transform_train(native, batch.len(), batch.as_slice())
        })?;
        state.is_trained = true;
        Ok(())
    }

    /// Maps `d_in`-dimensional vectors to `d_out` dimensions.
    pub fn apply(&self, vectors: &[f32]) -> Result<Vec<f32>> {
        let state = self.handle.live()?;
        let batch = VectorBatch::new(vectors, self.d_in)?;
        if !state.is_trained {
            return Err(Error::NotTrained);
        }
        let mut out = vec![0.0; batch.len() * self.d_out];
        if batch.is_empty() {
            return Ok(out);
        }
        let native = state.native_ref;
        self.runtime.gateway().call("transform_apply", |e| {
            e.transform_apply(native, batch.len(), batch.as_slice(), &mut out)
        })?;
        Ok(out)
    }

    /// Maps `d_out`-dimensional vectors back to the input space.
    pub fn reverse(&self, transformed: &[f32]) -> Result<Vec<f32>> {
        let state = self.handle.live()?;
        let batch = VectorBatch::new(transformed, self.d_out)?;
        if !state.is_trained {
            return Err(Error::NotTrained);
        }
        let mut out = vec![0.0; batch.len() * self.d_in];
        if batch.is_empty() {
            return Ok(out);
        }
        let native = state.native_ref;
        self.runtime.gateway().call("transform_reverse", |e| {
            e.transform_reverse(native, batch.len(), batch.as_slice(), &mut out)
        })?;
        Ok(out)
    }
}

impl fmt::Debug for VectorTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorTransform")
            .field("id", &self.handle.id())
            .field("kind", &self.kind)
            .field("d_in", &self.d_in)
            .field("d_out", &self.d_out)
            .finish()
    }
}
