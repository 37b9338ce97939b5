//! Bindings to the FAISS C API (`libfaiss_c`).
//!
//! Object references are the raw FAISS pointers cast to `usize`. Families the
//! C API has no constructor for are built through `faiss_index_factory` when
//! a description can express them; the rest (IVF-PQ and binary IVF over a
//! caller-supplied quantizer, refinement by an arbitrary index, in-memory
//! serialization, k-means iteration count and seed) report
//! [`status::UNSUPPORTED`].
//!
//! The C API exposes no runtime type name, so [`NativeEngine::describe`]
//! recovers it by probing the downcast functions from the most derived type
//! down.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_int, CStr, CString};
use std::path::Path;
use std::ptr;

use tracing::debug;

use super::{
    status, NativeClass, NativeEngine, NativeRef, NativeResult, ObjectInfo, QuantizerType, NULL_REF,
};
use crate::metric::MetricType;

type idx_t = i64;

#[repr(C)]
struct FaissIndex {
    _private: [u8; 0],
}
#[repr(C)]
struct FaissIndexBinary {
    _private: [u8; 0],
}
#[repr(C)]
struct FaissVectorTransform {
    _private: [u8; 0],
}
#[repr(C)]
struct FaissRangeSearchResult {
    _private: [u8; 0],
}
#[repr(C)]
struct FaissParameterSpace {
    _private: [u8; 0],
}
#[repr(C)]
struct FaissClustering {
    _private: [u8; 0],
}

#[link(name = "faiss_c")]
extern "C" {
    fn faiss_get_last_error() -> *const c_char;

    fn faiss_IndexFlat_new_with(p: *mut *mut FaissIndex, d: idx_t, metric: c_int) -> c_int;
    fn faiss_IndexIVFFlat_new_with_metric(
        p: *mut *mut FaissIndex,
        quantizer: *mut FaissIndex,
        d: usize,
        nlist: usize,
        metric: c_int,
    ) -> c_int;
    fn faiss_IndexIVFScalarQuantizer_new_with_metric(
        p: *mut *mut FaissIndex,
        quantizer: *mut FaissIndex,
        d: usize,
        nlist: usize,
        qtype: c_int,
        metric: c_int,
        encode_residual: c_int,
    ) -> c_int;
    fn faiss_IndexScalarQuantizer_new_with(
        p: *mut *mut FaissIndex,
        d: idx_t,
        qtype: c_int,
        metric: c_int,
    ) -> c_int;
    fn faiss_IndexLSH_new_with_options(
        p: *mut *mut FaissIndex,
        d: idx_t,
        nbits: c_int,
        rotate_data: c_int,
        train_thresholds: c_int,
    ) -> c_int;
    fn faiss_IndexIDMap_new(p: *mut *mut FaissIndex, base: *mut FaissIndex) -> c_int;
    fn faiss_IndexPreTransform_new_with_transform(
        p: *mut *mut FaissIndex,
        transform: *mut FaissVectorTransform,
        base: *mut FaissIndex,
    ) -> c_int;
    fn faiss_IndexShards_new(p: *mut *mut FaissIndex, d: idx_t) -> c_int;
    fn faiss_IndexShards_add_shard(shards: *mut FaissIndex, shard: *mut FaissIndex) -> c_int;
    fn faiss_index_factory(
        p: *mut *mut FaissIndex,
        d: c_int,
        description: *const c_char,
        metric: c_int,
    ) -> c_int;
    fn faiss_index_binary_factory(
        p: *mut *mut FaissIndexBinary,
        d: c_int,
        description: *const c_char,
    ) -> c_int;

    fn faiss_PCAMatrix_new_with(
        p: *mut *mut FaissVectorTransform,
        d_in: c_int,
        d_out: c_int,
        eigen_power: f32,
        random_rotation: c_int,
    ) -> c_int;
    fn faiss_OPQMatrix_new_with(
        p: *mut *mut FaissVectorTransform,
        d: c_int,
        m: c_int,
        d2: c_int,
    ) -> c_int;
    fn faiss_RandomRotationMatrix_new_with(
        p: *mut *mut FaissVectorTransform,
        d_in: c_int,
        d_out: c_int,
    ) -> c_int;

    fn faiss_Index_train(index: *mut FaissIndex, n: idx_t, x: *const f32) -> c_int;
    fn faiss_Index_add(index: *mut FaissIndex, n: idx_t, x: *const f32) -> c_int;
    fn faiss_Index_add_with_ids(
        index: *mut FaissIndex,
        n: idx_t,
        x: *const f32,
        ids: *const idx_t,
    ) -> c_int;
    fn faiss_Index_reset(index: *mut FaissIndex) -> c_int;
    fn faiss_Index_search(
        index: *const FaissIndex,
        n: idx_t,
        x: *const f32,
        k: idx_t,
        distances: *mut f32,
        labels: *mut idx_t,
    ) -> c_int;
    fn faiss_Index_assign(
        index: *mut FaissIndex,
        n: idx_t,
        x: *const f32,
        labels: *mut idx_t,
        k: idx_t,
    ) -> c_int;
    fn faiss_Index_range_search(
        index: *const FaissIndex,
        n: idx_t,
        x: *const f32,
        radius: f32,
        result: *mut FaissRangeSearchResult,
    ) -> c_int;
    fn faiss_Index_reconstruct(index: *const FaissIndex, key: idx_t, out: *mut f32) -> c_int;
    fn faiss_Index_reconstruct_n(
        index: *const FaissIndex,
        i0: idx_t,
        ni: idx_t,
        out: *mut f32,
    ) -> c_int;
    fn faiss_Index_free(index: *mut FaissIndex);
    fn faiss_Index_d(index: *const FaissIndex) -> c_int;
    fn faiss_Index_is_trained(index: *const FaissIndex) -> c_int;
    fn faiss_Index_ntotal(index: *const FaissIndex) -> idx_t;
    fn faiss_Index_metric_type(index: *const FaissIndex) -> c_int;

    fn faiss_IndexIVF_cast(index: *mut FaissIndex) -> *mut FaissIndex;
    fn faiss_IndexIVF_nlist(index: *const FaissIndex) -> usize;
    fn faiss_IndexIVF_nprobe(index: *const FaissIndex) -> usize;
    fn faiss_IndexIVF_set_own_fields(index: *mut FaissIndex, own: c_int);
    fn faiss_IndexIVFFlat_cast(index: *mut FaissIndex) -> *mut FaissIndex;
    fn faiss_IndexIVFScalarQuantizer_cast(index: *mut FaissIndex) -> *mut FaissIndex;
    fn faiss_IndexFlat_cast(index: *mut FaissIndex) -> *mut FaissIndex;
    fn faiss_IndexScalarQuantizer_cast(index: *mut FaissIndex) -> *mut FaissIndex;
    fn faiss_IndexLSH_cast(index: *mut FaissIndex) -> *mut FaissIndex;
    fn faiss_IndexIDMap_cast(index: *mut FaissIndex) -> *mut FaissIndex;
    fn faiss_IndexIDMap_set_own_fields(index: *mut FaissIndex, own: c_int);
    fn faiss_IndexPreTransform_cast(index: *mut FaissIndex) -> *mut FaissIndex;
    fn faiss_IndexPreTransform_set_own_fields(index: *mut FaissIndex, own: c_int);
    fn faiss_IndexRefineFlat_cast(index: *mut FaissIndex) -> *mut FaissIndex;

    fn faiss_ParameterSpace_new(p: *mut *mut FaissParameterSpace) -> c_int;
    fn faiss_ParameterSpace_set_index_parameter(
        space: *const FaissParameterSpace,
        index: *mut FaissIndex,
        name: *const c_char,
        value: f64,
    ) -> c_int;
    fn faiss_ParameterSpace_free(space: *mut FaissParameterSpace);

    fn faiss_RangeSearchResult_new(p: *mut *mut FaissRangeSearchResult, nq: idx_t) -> c_int;
    fn faiss_RangeSearchResult_nq(result: *const FaissRangeSearchResult) -> usize;
    fn faiss_RangeSearchResult_lims(result: *mut FaissRangeSearchResult, lims: *mut *mut usize);
    fn faiss_RangeSearchResult_labels(
        result: *mut FaissRangeSearchResult,
        labels: *mut *mut idx_t,
        distances: *mut *mut f32,
    );
    fn faiss_RangeSearchResult_free(result: *mut FaissRangeSearchResult);

    fn faiss_IndexBinary_train(index: *mut FaissIndexBinary, n: idx_t, x: *const u8) -> c_int;
    fn faiss_IndexBinary_add(index: *mut FaissIndexBinary, n: idx_t, x: *const u8) -> c_int;
    fn faiss_IndexBinary_search(
        index: *const FaissIndexBinary,
        n: idx_t,
        x: *const u8,
        k: idx_t,
        distances: *mut i32,
        labels: *mut idx_t,
    ) -> c_int;
    fn faiss_IndexBinary_reset(index: *mut FaissIndexBinary) -> c_int;
    fn faiss_IndexBinary_free(index: *mut FaissIndexBinary);
    fn faiss_IndexBinary_d(index: *const FaissIndexBinary) -> c_int;
    fn faiss_IndexBinary_is_trained(index: *const FaissIndexBinary) -> c_int;
    fn faiss_IndexBinary_ntotal(index: *const FaissIndexBinary) -> idx_t;

    fn faiss_VectorTransform_train(t: *mut FaissVectorTransform, n: idx_t, x: *const f32) -> c_int;
    fn faiss_VectorTransform_apply_noalloc(
        t: *const FaissVectorTransform,
        n: idx_t,
        x: *const f32,
        xt: *mut f32,
    );
    fn faiss_VectorTransform_reverse_transform(
        t: *const FaissVectorTransform,
        n: idx_t,
        xt: *const f32,
        x: *mut f32,
    );
    fn faiss_VectorTransform_free(t: *mut FaissVectorTransform);
    fn faiss_VectorTransform_d_in(t: *const FaissVectorTransform) -> c_int;
    fn faiss_VectorTransform_d_out(t: *const FaissVectorTransform) -> c_int;
    fn faiss_VectorTransform_is_trained(t: *const FaissVectorTransform) -> c_int;

    fn faiss_Clustering_new(p: *mut *mut FaissClustering, d: c_int, k: c_int) -> c_int;
    fn faiss_Clustering_train(
        clustering: *mut FaissClustering,
        n: idx_t,
        x: *const f32,
        index: *mut FaissIndex,
    ) -> c_int;
    fn faiss_Clustering_centroids(
        clustering: *mut FaissClustering,
        centroids: *mut *mut f32,
        size: *mut usize,
    );
    fn faiss_Clustering_d(clustering: *const FaissClustering) -> usize;
    fn faiss_Clustering_k(clustering: *const FaissClustering) -> usize;
    fn faiss_Clustering_free(clustering: *mut FaissClustering);

    fn faiss_write_index_fname(index: *const FaissIndex, fname: *const c_char) -> c_int;
    fn faiss_read_index_fname(fname: *const c_char, io_flags: c_int, p: *mut *mut FaissIndex)
        -> c_int;
}

extern "C" {
    fn omp_set_num_threads(n: c_int);
}

fn index(r: NativeRef) -> *mut FaissIndex {
    r as *mut FaissIndex
}

fn binary(r: NativeRef) -> *mut FaissIndexBinary {
    r as *mut FaissIndexBinary
}

fn transform(r: NativeRef) -> *mut FaissVectorTransform {
    r as *mut FaissVectorTransform
}

fn range(r: NativeRef) -> *mut FaissRangeSearchResult {
    r as *mut FaissRangeSearchResult
}

fn clustering(r: NativeRef) -> *mut FaissClustering {
    r as *mut FaissClustering
}

fn int(v: usize) -> NativeResult<c_int> {
    c_int::try_from(v).map_err(|_| status::ENGINE_ERROR)
}

fn idx(v: usize) -> NativeResult<idx_t> {
    idx_t::try_from(v).map_err(|_| status::ENGINE_ERROR)
}

fn check_live(r: NativeRef) -> NativeResult<()> {
    if r == NULL_REF {
        Err(status::INVALID_REF)
    } else {
        Ok(())
    }
}

/// Maps a C API return code, logging the engine's message on failure.
fn check(code: c_int) -> NativeResult<()> {
    if code == 0 {
        return Ok(());
    }
    // SAFETY: the C API returns null or a NUL-terminated thread-local string.
    let message = unsafe {
        let msg = faiss_get_last_error();
        if msg.is_null() {
            String::new()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    };
    debug!(code, message = %message, "faiss call failed");
    Err(code)
}

/// Runs a constructor that writes its result through an out pointer.
fn construct<T>(f: impl FnOnce(*mut *mut T) -> c_int) -> NativeResult<NativeRef> {
    let mut out: *mut T = ptr::null_mut();
    check(f(&mut out))?;
    if out.is_null() {
        return Err(status::ENGINE_ERROR);
    }
    Ok(out as NativeRef)
}

fn c_string(text: &str) -> NativeResult<CString> {
    CString::new(text).map_err(|_| status::ENGINE_ERROR)
}

fn c_path(path: &Path) -> NativeResult<CString> {
    let text = path.to_str().ok_or(status::ENGINE_ERROR)?;
    c_string(text)
}

fn metric_from(code: c_int) -> MetricType {
    MetricType::from_native(code).unwrap_or(MetricType::L2)
}

/// The FAISS engine. Stateless; all state lives in the native objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct FaissEngine;

impl FaissEngine {
    pub fn new() -> Self {
        Self
    }

    fn factory(&self, d: usize, description: &str, metric: MetricType) -> NativeResult<NativeRef> {
        let text = c_string(description)?;
        let d = int(d)?;
        // SAFETY: `text` outlives the call.
        construct(|p| unsafe { faiss_index_factory(p, d, text.as_ptr(), metric.native_code()) })
    }

    fn binary_factory(&self, d: usize, description: &str) -> NativeResult<NativeRef> {
        let text = c_string(description)?;
        let d = int(d)?;
        // SAFETY: `text` outlives the call.
        construct(|p| unsafe { faiss_index_binary_factory(p, d, text.as_ptr()) })
    }

    /// Copies the centroids of a clustering object; empty before training.
    fn centroids(&self, r: NativeRef) -> Vec<f32> {
        let mut data: *mut f32 = ptr::null_mut();
        let mut size = 0usize;
        // SAFETY: the clustering owns `size` centroid floats at `data`.
        unsafe {
            faiss_Clustering_centroids(clustering(r), &mut data, &mut size);
            if data.is_null() || size == 0 {
                return Vec::new();
            }
            std::slice::from_raw_parts(data, size).to_vec()
        }
    }

    /// Runs `f` against a temporary flat L2 index of dimension `d`, freeing
    /// it afterwards.
    fn with_flat_l2<T>(
        &self,
        d: usize,
        f: impl FnOnce(*mut FaissIndex) -> NativeResult<T>,
    ) -> NativeResult<T> {
        let flat = index(self.index_flat_new(d, MetricType::L2)?);
        let result = f(flat);
        // SAFETY: created above and not shared.
        unsafe { faiss_Index_free(flat) };
        result
    }

    fn type_name(&self, r: NativeRef) -> &'static str {
        let i = index(r);
        // SAFETY: downcasts only read the vtable of a live index.
        unsafe {
            if !faiss_IndexIDMap_cast(i).is_null() {
                "IndexIDMap"
            } else if !faiss_IndexPreTransform_cast(i).is_null() {
                "IndexPreTransform"
            } else if !faiss_IndexRefineFlat_cast(i).is_null() {
                "IndexRefineFlat"
            } else if !faiss_IndexIVFFlat_cast(i).is_null() {
                "IndexIVFFlat"
            } else if !faiss_IndexIVFScalarQuantizer_cast(i).is_null() {
                "IndexIVFScalarQuantizer"
            } else if !faiss_IndexIVF_cast(i).is_null() {
                "IndexIVF"
            } else if !faiss_IndexFlat_cast(i).is_null() {
                "IndexFlat"
            } else if !faiss_IndexScalarQuantizer_cast(i).is_null() {
                "IndexScalarQuantizer"
            } else if !faiss_IndexLSH_cast(i).is_null() {
                "IndexLSH"
            } else {
                "Index"
            }
        }
    }
}

impl NativeEngine for FaissEngine {
    fn name(&self) -> &'static str {
        "faiss"
    }

    fn set_num_threads(&self, threads: usize) -> NativeResult<()> {
        let n = int(threads)?;
        // SAFETY: plain OpenMP global setter.
        unsafe { omp_set_num_threads(n) };
        Ok(())
    }

    fn index_flat_new(&self, d: usize, metric: MetricType) -> NativeResult<NativeRef> {
        let d = idx(d)?;
        // SAFETY: out pointer is valid for the call.
        construct(|p| unsafe { faiss_IndexFlat_new_with(p, d, metric.native_code()) })
    }

    fn index_ivf_flat_new(
        &self,
        quantizer: NativeRef,
        d: usize,
        nlist: usize,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        check_live(quantizer)?;
        // SAFETY: `quantizer` is a live index owned by the caller.
        construct(|p| unsafe {
            faiss_IndexIVFFlat_new_with_metric(p, index(quantizer), d, nlist, metric.native_code())
        })
    }

    fn index_ivf_pq_new(
        &self,
        _quantizer: NativeRef,
        _d: usize,
        _nlist: usize,
        _m: usize,
        _nbits: usize,
        _metric: MetricType,
    ) -> NativeResult<NativeRef> {
        Err(status::UNSUPPORTED)
    }

    fn index_ivf_sq_new(
        &self,
        quantizer: NativeRef,
        d: usize,
        nlist: usize,
        qtype: QuantizerType,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        check_live(quantizer)?;
        // SAFETY: `quantizer` is a live index owned by the caller.
        construct(|p| unsafe {
            faiss_IndexIVFScalarQuantizer_new_with_metric(
                p,
                index(quantizer),
                d,
                nlist,
                qtype.native_code(),
                metric.native_code(),
                1,
            )
        })
    }

    fn index_hnsw_flat_new(&self, d: usize, m: usize, metric: MetricType) -> NativeResult<NativeRef> {
        self.factory(d, &format!("HNSW{},Flat", m), metric)
    }

    fn index_pq_new(
        &self,
        d: usize,
        m: usize,
        nbits: usize,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        self.factory(d, &format!("PQ{}x{}", m, nbits), metric)
    }

    fn index_sq_new(
        &self,
        d: usize,
        qtype: QuantizerType,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        let d = idx(d)?;
        // SAFETY: out pointer is valid for the call.
        construct(|p| unsafe {
            faiss_IndexScalarQuantizer_new_with(p, d, qtype.native_code(), metric.native_code())
        })
    }

    fn index_lsh_new(
        &self,
        d: usize,
        nbits: usize,
        rotate_data: bool,
        train_thresholds: bool,
    ) -> NativeResult<NativeRef> {
        let d = idx(d)?;
        let nbits = int(nbits)?;
        // SAFETY: out pointer is valid for the call.
        construct(|p| unsafe {
            faiss_IndexLSH_new_with_options(
                p,
                d,
                nbits,
                c_int::from(rotate_data),
                c_int::from(train_thresholds),
            )
        })
    }

    fn index_idmap_new(&self, base: NativeRef) -> NativeResult<NativeRef> {
        check_live(base)?;
        // SAFETY: `base` is a live index owned by the caller.
        construct(|p| unsafe { faiss_IndexIDMap_new(p, index(base)) })
    }

    fn index_refine_new(&self, _base: NativeRef, _refine: NativeRef) -> NativeResult<NativeRef> {
        Err(status::UNSUPPORTED)
    }

    fn index_pretransform_new(&self, t: NativeRef, base: NativeRef) -> NativeResult<NativeRef> {
        check_live(t)?;
        check_live(base)?;
        // SAFETY: both children are live and owned by the caller.
        construct(|p| unsafe {
            faiss_IndexPreTransform_new_with_transform(p, transform(t), index(base))
        })
    }

    fn index_shards_new(&self, d: usize, metric: MetricType) -> NativeResult<NativeRef> {
        if metric != MetricType::L2 {
            return Err(status::UNSUPPORTED);
        }
        let d = idx(d)?;
        // SAFETY: out pointer is valid for the call.
        construct(|p| unsafe { faiss_IndexShards_new(p, d) })
    }

    fn index_shards_add_shard(&self, shards: NativeRef, shard: NativeRef) -> NativeResult<()> {
        check_live(shards)?;
        check_live(shard)?;
        // SAFETY: both are live indexes.
        check(unsafe { faiss_IndexShards_add_shard(index(shards), index(shard)) })
    }

    fn index_factory(
        &self,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        self.factory(d, description, metric)
    }

    fn binary_flat_new(&self, d: usize) -> NativeResult<NativeRef> {
        self.binary_factory(d, "BFlat")
    }

    fn binary_ivf_new(&self, _quantizer: NativeRef, _d: usize, _nlist: usize)
        -> NativeResult<NativeRef> {
        Err(status::UNSUPPORTED)
    }

    fn binary_hash_new(&self, d: usize, nbits: usize) -> NativeResult<NativeRef> {
        self.binary_factory(d, &format!("BHash{}", nbits))
    }

    fn pca_matrix_new(
        &self,
        d_in: usize,
        d_out: usize,
        eigen_power: f32,
        random_rotation: bool,
    ) -> NativeResult<NativeRef> {
        let (d_in, d_out) = (int(d_in)?, int(d_out)?);
        // SAFETY: out pointer is valid for the call.
        construct(|p| unsafe {
            faiss_PCAMatrix_new_with(p, d_in, d_out, eigen_power, c_int::from(random_rotation))
        })
    }

    fn opq_matrix_new(&self, d: usize, m: usize) -> NativeResult<NativeRef> {
        let (d, m) = (int(d)?, int(m)?);
        // SAFETY: out pointer is valid for the call.
        construct(|p| unsafe { faiss_OPQMatrix_new_with(p, d, m, d) })
    }

    fn random_rotation_new(&self, d_in: usize, d_out: usize) -> NativeResult<NativeRef> {
        let (d_in, d_out) = (int(d_in)?, int(d_out)?);
        // SAFETY: out pointer is valid for the call.
        construct(|p| unsafe { faiss_RandomRotationMatrix_new_with(p, d_in, d_out) })
    }

    fn train(&self, r: NativeRef, n: usize, x: &[f32]) -> NativeResult<()> {
        check_live(r)?;
        // SAFETY: `x` holds `n * d` floats, checked by the caller.
        check(unsafe { faiss_Index_train(index(r), idx(n)?, x.as_ptr()) })
    }

    fn add(&self, r: NativeRef, n: usize, x: &[f32]) -> NativeResult<()> {
        check_live(r)?;
        // SAFETY: `x` holds `n * d` floats.
        check(unsafe { faiss_Index_add(index(r), idx(n)?, x.as_ptr()) })
    }

    fn add_with_ids(&self, r: NativeRef, n: usize, x: &[f32], ids: &[i64]) -> NativeResult<()> {
        check_live(r)?;
        if ids.len() != n {
            return Err(status::ENGINE_ERROR);
        }
        // SAFETY: `x` holds `n * d` floats and `ids` holds `n` labels.
        check(unsafe { faiss_Index_add_with_ids(index(r), idx(n)?, x.as_ptr(), ids.as_ptr()) })
    }

    fn reset(&self, r: NativeRef) -> NativeResult<()> {
        check_live(r)?;
        // SAFETY: live index.
        check(unsafe { faiss_Index_reset(index(r)) })
    }

    fn set_parameter(&self, r: NativeRef, name: &str, value: f64) -> NativeResult<()> {
        check_live(r)?;
        let name = c_string(name)?;
        // SAFETY: out pointer is valid for the call.
        let space = construct(|p| unsafe { faiss_ParameterSpace_new(p) })?;
        let space = space as *mut FaissParameterSpace;
        // SAFETY: `space` was just created and is freed below; `name` outlives the call.
        let code = unsafe {
            faiss_ParameterSpace_set_index_parameter(space, index(r), name.as_ptr(), value)
        };
        // SAFETY: created above, not shared.
        unsafe { faiss_ParameterSpace_free(space) };
        check(code)
    }

    fn get_parameter(&self, r: NativeRef, name: &str) -> NativeResult<f64> {
        check_live(r)?;
        if name != "nprobe" {
            return Err(status::UNSUPPORTED);
        }
        // SAFETY: downcast of a live index.
        let ivf = unsafe { faiss_IndexIVF_cast(index(r)) };
        if ivf.is_null() {
            return Err(status::ENGINE_ERROR);
        }
        // SAFETY: `ivf` is a live inverted-file index.
        Ok(unsafe { faiss_IndexIVF_nprobe(ivf) } as f64)
    }

    fn search(
        &self,
        r: NativeRef,
        n: usize,
        x: &[f32],
        k: usize,
        distances: &mut [f32],
        labels: &mut [i64],
    ) -> NativeResult<()> {
        check_live(r)?;
        if distances.len() < n * k || labels.len() < n * k {
            return Err(status::ENGINE_ERROR);
        }
        // SAFETY: output buffers hold at least `n * k` slots.
        check(unsafe {
            faiss_Index_search(
                index(r),
                idx(n)?,
                x.as_ptr(),
                idx(k)?,
                distances.as_mut_ptr(),
                labels.as_mut_ptr(),
            )
        })
    }

    fn assign(&self, r: NativeRef, n: usize, x: &[f32], labels: &mut [i64]) -> NativeResult<()> {
        check_live(r)?;
        if labels.len() < n {
            return Err(status::ENGINE_ERROR);
        }
        // SAFETY: `labels` holds at least `n` slots.
        check(unsafe { faiss_Index_assign(index(r), idx(n)?, x.as_ptr(), labels.as_mut_ptr(), 1) })
    }

    fn reconstruct(&self, r: NativeRef, key: i64, out: &mut [f32]) -> NativeResult<()> {
        check_live(r)?;
        // SAFETY: `out` holds `d` floats.
        check(unsafe { faiss_Index_reconstruct(index(r), key, out.as_mut_ptr()) })
    }

    fn reconstruct_n(&self, r: NativeRef, start: i64, n: usize, out: &mut [f32]) -> NativeResult<()> {
        check_live(r)?;
        // SAFETY: `out` holds `n * d` floats.
        check(unsafe { faiss_Index_reconstruct_n(index(r), start, idx(n)?, out.as_mut_ptr()) })
    }

    fn range_result_new(&self, nq: usize) -> NativeResult<NativeRef> {
        let nq = idx(nq)?;
        // SAFETY: out pointer is valid for the call.
        construct(|p| unsafe { faiss_RangeSearchResult_new(p, nq) })
    }

    fn range_search(
        &self,
        r: NativeRef,
        n: usize,
        x: &[f32],
        radius: f32,
        result: NativeRef,
    ) -> NativeResult<()> {
        check_live(r)?;
        check_live(result)?;
        // SAFETY: `result` was allocated for `n` queries.
        check(unsafe { faiss_Index_range_search(index(r), idx(n)?, x.as_ptr(), radius, range(result)) })
    }

    fn range_result_size(&self, result: NativeRef) -> NativeResult<usize> {
        check_live(result)?;
        let mut lims: *mut usize = ptr::null_mut();
        // SAFETY: `lims` points at `nq + 1` offsets owned by the container.
        unsafe {
            let nq = faiss_RangeSearchResult_nq(range(result));
            faiss_RangeSearchResult_lims(range(result), &mut lims);
            if lims.is_null() {
                return Err(status::ENGINE_ERROR);
            }
            Ok(*lims.add(nq))
        }
    }

    fn range_result_copy(
        &self,
        result: NativeRef,
        offsets: &mut [usize],
        labels: &mut [i64],
        distances: &mut [f32],
    ) -> NativeResult<()> {
        check_live(result)?;
        let mut lims: *mut usize = ptr::null_mut();
        let mut lab: *mut idx_t = ptr::null_mut();
        let mut dis: *mut f32 = ptr::null_mut();
        // SAFETY: the container holds `nq + 1` offsets and `lims[nq]` hits;
        // the caller sized the destination buffers from `range_result_size`.
        unsafe {
            let nq = faiss_RangeSearchResult_nq(range(result));
            if offsets.len() != nq + 1 {
                return Err(status::ENGINE_ERROR);
            }
            faiss_RangeSearchResult_lims(range(result), &mut lims);
            faiss_RangeSearchResult_labels(range(result), &mut lab, &mut dis);
            if lims.is_null() {
                return Err(status::ENGINE_ERROR);
            }
            offsets.copy_from_slice(std::slice::from_raw_parts(lims, nq + 1));
            let total = offsets[nq];
            if labels.len() != total || distances.len() != total {
                return Err(status::ENGINE_ERROR);
            }
            if total > 0 {
                if lab.is_null() || dis.is_null() {
                    return Err(status::ENGINE_ERROR);
                }
                labels.copy_from_slice(std::slice::from_raw_parts(lab, total));
                distances.copy_from_slice(std::slice::from_raw_parts(dis, total));
            }
        }
        Ok(())
    }

    fn range_result_free(&self, result: NativeRef) -> NativeResult<()> {
        check_live(result)?;
        // SAFETY: the container is freed exactly once by its owner.
        unsafe { faiss_RangeSearchResult_free(range(result)) };
        Ok(())
    }

    fn binary_train(&self, r: NativeRef, n: usize, x: &[u8]) -> NativeResult<()> {
        check_live(r)?;
        // SAFETY: `x` holds `n` codes.
        check(unsafe { faiss_IndexBinary_train(binary(r), idx(n)?, x.as_ptr()) })
    }

    fn binary_add(&self, r: NativeRef, n: usize, x: &[u8]) -> NativeResult<()> {
        check_live(r)?;
        // SAFETY: `x` holds `n` codes.
        check(unsafe { faiss_IndexBinary_add(binary(r), idx(n)?, x.as_ptr()) })
    }

    fn binary_search(
        &self,
        r: NativeRef,
        n: usize,
        x: &[u8],
        k: usize,
        distances: &mut [i32],
        labels: &mut [i64],
    ) -> NativeResult<()> {
        check_live(r)?;
        if distances.len() < n * k || labels.len() < n * k {
            return Err(status::ENGINE_ERROR);
        }
        // SAFETY: output buffers hold at least `n * k` slots.
        check(unsafe {
            faiss_IndexBinary_search(
                binary(r),
                idx(n)?,
                x.as_ptr(),
                idx(k)?,
                distances.as_mut_ptr(),
                labels.as_mut_ptr(),
            )
        })
    }

    fn binary_reset(&self, r: NativeRef) -> NativeResult<()> {
        check_live(r)?;
        // SAFETY: live binary index.
        check(unsafe { faiss_IndexBinary_reset(binary(r)) })
    }

    fn transform_train(&self, t: NativeRef, n: usize, x: &[f32]) -> NativeResult<()> {
        check_live(t)?;
        // SAFETY: `x` holds `n * d_in` floats.
        check(unsafe { faiss_VectorTransform_train(transform(t), idx(n)?, x.as_ptr()) })
    }

    fn transform_apply(&self, t: NativeRef, n: usize, x: &[f32], out: &mut [f32]) -> NativeResult<()> {
        check_live(t)?;
        // SAFETY: `out` holds `n * d_out` floats.
        unsafe { faiss_VectorTransform_apply_noalloc(transform(t), idx(n)?, x.as_ptr(), out.as_mut_ptr()) };
        Ok(())
    }

    fn transform_reverse(
        &self,
        t: NativeRef,
        n: usize,
        xt: &[f32],
        out: &mut [f32],
    ) -> NativeResult<()> {
        check_live(t)?;
        // SAFETY: `out` holds `n * d_in` floats.
        unsafe {
            faiss_VectorTransform_reverse_transform(transform(t), idx(n)?, xt.as_ptr(), out.as_mut_ptr())
        };
        Ok(())
    }

    fn kmeans_new(&self, d: usize, k: usize) -> NativeResult<NativeRef> {
        let (d, k) = (int(d)?, int(k)?);
        // SAFETY: out pointer is valid for the call.
        construct(|p| unsafe { faiss_Clustering_new(p, d, k) })
    }

    fn kmeans_set_niter(&self, _kmeans: NativeRef, _niter: usize) -> NativeResult<()> {
        Err(status::UNSUPPORTED)
    }

    fn kmeans_set_seed(&self, _kmeans: NativeRef, _seed: u64) -> NativeResult<()> {
        Err(status::UNSUPPORTED)
    }

    fn kmeans_train(&self, kmeans: NativeRef, n: usize, x: &[f32]) -> NativeResult<()> {
        check_live(kmeans)?;
        let n = idx(n)?;
        // SAFETY: live clustering object.
        let d = unsafe { faiss_Clustering_d(clustering(kmeans)) };
        self.with_flat_l2(d, |flat| {
            // SAFETY: `x` holds `n * d` floats; `flat` lives for the call.
            check(unsafe { faiss_Clustering_train(clustering(kmeans), n, x.as_ptr(), flat) })
        })
    }

    fn kmeans_centroids(&self, kmeans: NativeRef, out: &mut [f32]) -> NativeResult<()> {
        check_live(kmeans)?;
        let centroids = self.centroids(kmeans);
        if centroids.is_empty() || centroids.len() != out.len() {
            return Err(status::ENGINE_ERROR);
        }
        out.copy_from_slice(&centroids);
        Ok(())
    }

    fn kmeans_assign(
        &self,
        kmeans: NativeRef,
        n: usize,
        x: &[f32],
        labels: &mut [i64],
    ) -> NativeResult<()> {
        check_live(kmeans)?;
        if labels.len() < n {
            return Err(status::ENGINE_ERROR);
        }
        let centroids = self.centroids(kmeans);
        // SAFETY: live clustering object.
        let (d, k) = unsafe {
            (
                faiss_Clustering_d(clustering(kmeans)),
                faiss_Clustering_k(clustering(kmeans)),
            )
        };
        if centroids.is_empty() || centroids.len() != d * k {
            return Err(status::ENGINE_ERROR);
        }
        let (n, k) = (idx(n)?, idx(k)?);
        self.with_flat_l2(d, |flat| {
            // SAFETY: `centroids` holds `k * d` floats, `x` holds `n * d`,
            // and `labels` at least `n` slots.
            unsafe {
                check(faiss_Index_add(flat, k, centroids.as_ptr()))?;
                check(faiss_Index_assign(flat, n, x.as_ptr(), labels.as_mut_ptr(), 1))
            }
        })
    }

    fn free(&self, class: NativeClass, object: NativeRef) -> NativeResult<()> {
        check_live(object)?;
        // SAFETY: the gateway frees each live object exactly once.
        unsafe {
            match class {
                NativeClass::Index => faiss_Index_free(index(object)),
                NativeClass::BinaryIndex => faiss_IndexBinary_free(binary(object)),
                NativeClass::Transform => faiss_VectorTransform_free(transform(object)),
                NativeClass::Clustering => faiss_Clustering_free(clustering(object)),
            }
        }
        Ok(())
    }

    fn set_own_fields(&self, object: NativeRef, own: bool) -> NativeResult<()> {
        check_live(object)?;
        let flag = c_int::from(own);
        let i = index(object);
        // SAFETY: each setter is applied only after its downcast succeeds.
        unsafe {
            match self.type_name(object) {
                "IndexIDMap" => faiss_IndexIDMap_set_own_fields(faiss_IndexIDMap_cast(i), flag),
                "IndexPreTransform" => {
                    faiss_IndexPreTransform_set_own_fields(faiss_IndexPreTransform_cast(i), flag)
                }
                "IndexIVFFlat" | "IndexIVFScalarQuantizer" | "IndexIVF" => {
                    faiss_IndexIVF_set_own_fields(faiss_IndexIVF_cast(i), flag)
                }
                // Shards and other composites default to not owning.
                _ if !own => {}
                _ => return Err(status::UNSUPPORTED),
            }
        }
        Ok(())
    }

    fn describe(&self, class: NativeClass, object: NativeRef) -> NativeResult<ObjectInfo> {
        check_live(object)?;
        // SAFETY: getters on a live object of the stated class.
        unsafe {
            match class {
                NativeClass::Index => {
                    let i = index(object);
                    let ivf = faiss_IndexIVF_cast(i);
                    Ok(ObjectInfo {
                        type_name: self.type_name(object).to_string(),
                        dimension: faiss_Index_d(i).max(0) as usize,
                        metric: metric_from(faiss_Index_metric_type(i)),
                        ntotal: faiss_Index_ntotal(i).max(0) as usize,
                        is_trained: faiss_Index_is_trained(i) != 0,
                        nlist: (!ivf.is_null()).then(|| faiss_IndexIVF_nlist(ivf)),
                        d_out: None,
                    })
                }
                NativeClass::BinaryIndex => {
                    let b = binary(object);
                    Ok(ObjectInfo {
                        type_name: "IndexBinary".to_string(),
                        dimension: faiss_IndexBinary_d(b).max(0) as usize,
                        metric: MetricType::L2,
                        ntotal: faiss_IndexBinary_ntotal(b).max(0) as usize,
                        is_trained: faiss_IndexBinary_is_trained(b) != 0,
                        nlist: None,
                        d_out: None,
                    })
                }
                NativeClass::Transform => {
                    let t = transform(object);
                    Ok(ObjectInfo {
                        type_name: "VectorTransform".to_string(),
                        dimension: faiss_VectorTransform_d_in(t).max(0) as usize,
                        metric: MetricType::L2,
                        ntotal: 0,
                        is_trained: faiss_VectorTransform_is_trained(t) != 0,
                        nlist: None,
                        d_out: Some(faiss_VectorTransform_d_out(t).max(0) as usize),
                    })
                }
                NativeClass::Clustering => {
                    let c = clustering(object);
                    Ok(ObjectInfo {
                        type_name: "Clustering".to_string(),
                        dimension: faiss_Clustering_d(c),
                        metric: MetricType::L2,
                        ntotal: 0,
                        is_trained: !self.centroids(object).is_empty(),
                        nlist: Some(faiss_Clustering_k(c)),
                        d_out: None,
                    })
                }
            }
        }
    }

    fn write_index(&self, r: NativeRef, path: &Path) -> NativeResult<()> {
        check_live(r)?;
        let fname = c_path(path)?;
        // SAFETY: `fname` outlives the call.
        check(unsafe { faiss_write_index_fname(index(r), fname.as_ptr()) })
    }

    fn read_index(&self, path: &Path) -> NativeResult<NativeRef> {
        let fname = c_path(path)?;
        // SAFETY: `fname` outlives the call.
        construct(|p| unsafe { faiss_read_index_fname(fname.as_ptr(), 0, p) })
    }

    fn serialize_index(&self, _r: NativeRef) -> NativeResult<Vec<u8>> {
        Err(status::UNSUPPORTED)
    }

    fn deserialize_index(&self, _bytes: &[u8]) -> NativeResult<NativeRef> {
        Err(status::UNSUPPORTED)
    }
}
