//! In-process reference engine.
//!
//! `MockEngine` implements the whole function table with exact search
//! standing in for every index algorithm. It models the parts of native
//! behavior the wrapper depends on:
//!
//! - objects live in a registry keyed by never-reused references, and
//!   freeing a reference twice or using it after free is recorded as a
//!   [`Violation`] instead of corrupting memory
//! - composites carry an `own_fields` flag; freeing a composite with the flag
//!   set frees its children too
//! - training preconditions, untrained adds, and unsupported operations
//!   fail with [`status::ENGINE_ERROR`]
//! - every entry point is counted, and a failure can be injected for the next
//!   call of any function with [`MockEngine::fail_next`]
//!
//! L2 scores are squared distances, like the native engine reports them.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use super::{
    status, NativeClass, NativeEngine, NativeRef, NativeResult, ObjectInfo, QuantizerType,
    Status,
};
use crate::descriptor::{CoreStage, IvfStorage, PipelineDescriptor, TransformStage};
use crate::metric::{hamming, l2_squared, MetricType};

const FAIL: Status = status::ENGINE_ERROR;

/// A lifetime error the engine caught instead of crashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// `free` on an object that was already freed.
    DoubleFree(NativeRef),
    /// Any call on an object that was already freed.
    UseAfterFree {
        function: &'static str,
        object: NativeRef,
    },
    /// A reference the engine never handed out.
    UnknownRef {
        function: &'static str,
        object: NativeRef,
    },
}

/// In-process engine with exact search and lifetime checking.
///
/// # Example
///
/// ```
/// use vecgate_core::engine::{MockEngine, NativeEngine};
/// use vecgate_core::MetricType;
///
/// let engine = MockEngine::new();
/// let index = engine.index_flat_new(2, MetricType::L2).unwrap();
/// engine.add(index, 2, &[0.0, 0.0, 1.0, 1.0]).unwrap();
///
/// let mut distances = [0.0; 1];
/// let mut labels = [0i64; 1];
/// engine.search(index, 1, &[1.0, 1.0], 1, &mut distances, &mut labels).unwrap();
/// assert_eq!(labels[0], 1);
/// assert_eq!(engine.calls("add"), 1);
/// ```
#[derive(Default)]
pub struct MockEngine {
    registry: Mutex<Registry>,
    calls: Mutex<HashMap<&'static str, u64>>,
    failures: Mutex<HashMap<&'static str, Status>>,
    threads: AtomicUsize,
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine")
            .field("live_objects", &self.live_objects())
            .field("total_calls", &self.total_calls())
            .finish()
    }
}

impl MockEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `function` has been entered.
    pub fn calls(&self, function: &str) -> u64 {
        self.calls.lock().get(function).copied().unwrap_or(0)
    }

    /// Number of calls across all functions.
    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    /// Clears all call counters.
    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    /// Makes the next call to `function` fail with `code`.
    pub fn fail_next(&self, function: &'static str, code: Status) {
        self.failures.lock().insert(function, code);
    }

    /// Number of objects currently allocated.
    pub fn live_objects(&self) -> usize {
        self.registry.lock().live.len()
    }

    /// Returns true if `object` is allocated.
    pub fn is_live(&self, object: NativeRef) -> bool {
        self.registry.lock().live.contains_key(&object)
    }

    /// Current ownership flag of a composite, if `object` is one.
    pub fn own_fields(&self, object: NativeRef) -> Option<bool> {
        match self.registry.lock().live.get(&object) {
            Some(Object::Index(obj)) if !obj.body.children().is_empty() => Some(obj.own_fields),
            Some(Object::Binary(obj)) if obj.quantizer.is_some() => Some(obj.own_fields),
            _ => None,
        }
    }

    /// Lifetime violations observed so far.
    pub fn violations(&self) -> Vec<Violation> {
        self.registry.lock().violations.clone()
    }

    /// Thread count last set through [`NativeEngine::set_num_threads`].
    pub fn num_threads(&self) -> usize {
        self.threads.load(AtomicOrdering::Relaxed)
    }

    /// Counts the call, applies an injected failure, and locks the registry.
    fn enter(&self, function: &'static str) -> NativeResult<MutexGuard<'_, Registry>> {
        *self.calls.lock().entry(function).or_insert(0) += 1;
        if let Some(code) = self.failures.lock().remove(function) {
            return Err(code);
        }
        let mut registry = self.registry.lock();
        registry.function = function;
        Ok(registry)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Store {
    vectors: Vec<f32>,
    labels: Vec<i64>,
}

impl Store {
    fn clear(&mut self) {
        self.vectors.clear();
        self.labels.clear();
    }

    fn position(&self, label: i64) -> Option<usize> {
        let guess = usize::try_from(label).ok();
        if let Some(pos) = guess.filter(|&p| self.labels.get(p) == Some(&label)) {
            return Some(pos);
        }
        self.labels.iter().position(|&l| l == label)
    }
}

/// A contiguous block of vectors routed to one shard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Segment {
    shard: usize,
    global_start: i64,
    local_start: i64,
    count: usize,
}

#[derive(Debug, Clone)]
enum Body {
    Leaf(Store),
    Ivf {
        quantizer: NativeRef,
        nlist: usize,
        store: Store,
    },
    IdMap {
        base: NativeRef,
        ids: Vec<i64>,
    },
    Refine {
        base: NativeRef,
        refine: NativeRef,
    },
    PreTransform {
        transform: NativeRef,
        base: NativeRef,
    },
    Shards {
        shards: Vec<NativeRef>,
        segments: Vec<Segment>,
    },
}

impl Body {
    fn children(&self) -> Vec<NativeRef> {
        match self {
            Body::Leaf(_) => Vec::new(),
            Body::Ivf { quantizer, .. } => vec![*quantizer],
            Body::IdMap { base, .. } => vec![*base],
            Body::Refine { base, refine } => vec![*base, *refine],
            Body::PreTransform { transform, base } => vec![*transform, *base],
            Body::Shards { shards, .. } => shards.clone(),
        }
    }

    fn shape(&self) -> Shape {
        match self {
            Body::Leaf(_) => Shape::Leaf,
            Body::Ivf {
                quantizer, nlist, ..
            } => Shape::Ivf {
                quantizer: *quantizer,
                nlist: *nlist,
            },
            Body::IdMap { base, .. } => Shape::IdMap { base: *base },
            Body::Refine { base, refine } => Shape::Refine {
                base: *base,
                refine: *refine,
            },
            Body::PreTransform { transform, base } => Shape::PreTransform {
                transform: *transform,
                base: *base,
            },
            Body::Shards { shards, .. } => Shape::Shards(shards.clone()),
        }
    }

    fn store_mut(&mut self) -> Option<&mut Store> {
        match self {
            Body::Leaf(store) | Body::Ivf { store, .. } => Some(store),
            _ => None,
        }
    }
}

/// Child references of a body, copied out so the registry can be re-borrowed.
enum Shape {
    Leaf,
    Ivf { quantizer: NativeRef, nlist: usize },
    IdMap { base: NativeRef },
    Refine { base: NativeRef, refine: NativeRef },
    PreTransform { transform: NativeRef, base: NativeRef },
    Shards(Vec<NativeRef>),
}

#[derive(Debug, Clone)]
struct IndexObject {
    type_name: String,
    d: usize,
    metric: MetricType,
    trained: bool,
    min_training: usize,
    own_fields: bool,
    params: BTreeMap<String, f64>,
    body: Body,
}

impl IndexObject {
    fn leaf(type_name: &str, d: usize, metric: MetricType, min_training: usize) -> Self {
        Self {
            type_name: type_name.to_string(),
            d,
            metric,
            trained: min_training == 0,
            min_training,
            own_fields: false,
            params: BTreeMap::new(),
            body: Body::Leaf(Store::default()),
        }
    }

    fn composite(type_name: &str, d: usize, metric: MetricType, body: Body) -> Self {
        Self {
            type_name: type_name.to_string(),
            d,
            metric,
            trained: false,
            min_training: 0,
            own_fields: false,
            params: BTreeMap::new(),
            body,
        }
    }

    fn is_graph(&self) -> bool {
        self.type_name.starts_with("IndexHNSW")
    }
}

#[derive(Debug, Clone)]
struct BinaryObject {
    type_name: &'static str,
    d: usize,
    trained: bool,
    own_fields: bool,
    codes: Vec<u8>,
    quantizer: Option<NativeRef>,
    nlist: usize,
}

impl BinaryObject {
    fn code_size(&self) -> usize {
        self.d / 8
    }

    fn ntotal(&self) -> usize {
        self.codes.len() / self.code_size()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransformObject {
    type_name: String,
    d_in: usize,
    d_out: usize,
    trained: bool,
}

/// FAISS clustering defaults.
const KMEANS_NITER: usize = 25;
const KMEANS_SEED: u64 = 1234;

#[derive(Debug, Clone)]
struct KmeansObject {
    d: usize,
    k: usize,
    niter: usize,
    seed: u64,
    centroids: Vec<f32>,
}

impl KmeansObject {
    fn nearest(&self, x: &[f32]) -> usize {
        nearest_row(&self.centroids, self.d, x)
    }

    /// Lloyd iterations from `k` evenly spaced, seed-rotated training rows.
    /// A cluster left empty keeps its previous centroid.
    fn train(&mut self, x: &[f32]) {
        let (d, k) = (self.d, self.k);
        let n = x.len() / d;
        let start = (self.seed % n as u64) as usize;
        let mut centroids = Vec::with_capacity(k * d);
        for c in 0..k {
            let row = (start + c * n / k) % n;
            centroids.extend_from_slice(&x[row * d..(row + 1) * d]);
        }
        for _ in 0..self.niter {
            let mut sums = vec![0.0f32; k * d];
            let mut counts = vec![0usize; k];
            for v in x.chunks_exact(d) {
                let c = nearest_row(&centroids, d, v);
                counts[c] += 1;
                for (sum, value) in sums[c * d..(c + 1) * d].iter_mut().zip(v) {
                    *sum += value;
                }
            }
            for (c, &count) in counts.iter().enumerate() {
                if count > 0 {
                    for j in 0..d {
                        centroids[c * d + j] = sums[c * d + j] / count as f32;
                    }
                }
            }
        }
        self.centroids = centroids;
    }
}

fn nearest_row(rows: &[f32], d: usize, x: &[f32]) -> usize {
    rows.chunks_exact(d)
        .map(|row| l2_squared(row, x))
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        .map_or(0, |(i, _)| i)
}

#[derive(Debug, Clone)]
struct RangeObject {
    nq: usize,
    offsets: Vec<usize>,
    labels: Vec<i64>,
    distances: Vec<f32>,
}

#[derive(Debug, Clone)]
enum Object {
    Index(IndexObject),
    Binary(BinaryObject),
    Transform(TransformObject),
    Kmeans(KmeansObject),
    Range(RangeObject),
}

impl Object {
    fn class(&self) -> Option<NativeClass> {
        match self {
            Object::Index(_) => Some(NativeClass::Index),
            Object::Binary(_) => Some(NativeClass::BinaryIndex),
            Object::Transform(_) => Some(NativeClass::Transform),
            Object::Kmeans(_) => Some(NativeClass::Clustering),
            Object::Range(_) => None,
        }
    }

    fn owned_children(&self) -> Vec<NativeRef> {
        match self {
            Object::Index(obj) if obj.own_fields => obj.body.children(),
            Object::Binary(obj) if obj.own_fields => obj.quantizer.into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Serialized form of an object tree.
#[derive(Debug, Serialize, Deserialize)]
enum Saved {
    Index {
        type_name: String,
        d: usize,
        metric: MetricType,
        trained: bool,
        min_training: usize,
        params: BTreeMap<String, f64>,
        body: SavedBody,
    },
    Transform(TransformObject),
}

#[derive(Debug, Serialize, Deserialize)]
enum SavedBody {
    Leaf(Store),
    Ivf {
        quantizer: Box<Saved>,
        nlist: usize,
        store: Store,
    },
    IdMap {
        base: Box<Saved>,
        ids: Vec<i64>,
    },
    Refine {
        base: Box<Saved>,
        refine: Box<Saved>,
    },
    PreTransform {
        transform: Box<Saved>,
        base: Box<Saved>,
    },
    Shards {
        shards: Vec<Saved>,
        segments: Vec<Segment>,
    },
}

#[derive(Default)]
struct Registry {
    next: NativeRef,
    live: HashMap<NativeRef, Object>,
    freed: HashSet<NativeRef>,
    violations: Vec<Violation>,
    function: &'static str,
}

impl Registry {
    fn insert(&mut self, object: Object) -> NativeRef {
        self.next += 1;
        self.live.insert(self.next, object);
        self.next
    }

    /// Records why `object` could not be found.
    fn missing(&mut self, object: NativeRef) -> Status {
        let function = self.function;
        if self.freed.contains(&object) {
            self.violations
                .push(Violation::UseAfterFree { function, object });
        } else {
            self.violations.push(Violation::UnknownRef { function, object });
        }
        status::INVALID_REF
    }

    fn index(&mut self, r: NativeRef) -> NativeResult<&mut IndexObject> {
        if !self.live.contains_key(&r) {
            return Err(self.missing(r));
        }
        match self.live.get_mut(&r) {
            Some(Object::Index(obj)) => Ok(obj),
            _ => Err(FAIL),
        }
    }

    fn binary(&mut self, r: NativeRef) -> NativeResult<&mut BinaryObject> {
        if !self.live.contains_key(&r) {
            return Err(self.missing(r));
        }
        match self.live.get_mut(&r) {
            Some(Object::Binary(obj)) => Ok(obj),
            _ => Err(FAIL),
        }
    }

    fn transform(&mut self, r: NativeRef) -> NativeResult<&mut TransformObject> {
        if !self.live.contains_key(&r) {
            return Err(self.missing(r));
        }
        match self.live.get_mut(&r) {
            Some(Object::Transform(obj)) => Ok(obj),
            _ => Err(FAIL),
        }
    }

    fn kmeans(&mut self, r: NativeRef) -> NativeResult<&mut KmeansObject> {
        if !self.live.contains_key(&r) {
            return Err(self.missing(r));
        }
        match self.live.get_mut(&r) {
            Some(Object::Kmeans(obj)) => Ok(obj),
            _ => Err(FAIL),
        }
    }

    fn range(&mut self, r: NativeRef) -> NativeResult<&mut RangeObject> {
        if !self.live.contains_key(&r) {
            return Err(self.missing(r));
        }
        match self.live.get_mut(&r) {
            Some(Object::Range(obj)) => Ok(obj),
            _ => Err(FAIL),
        }
    }

    fn head(&mut self, r: NativeRef) -> NativeResult<(usize, MetricType, Shape)> {
        let obj = self.index(r)?;
        Ok((obj.d, obj.metric, obj.body.shape()))
    }

    fn free(&mut self, r: NativeRef) -> NativeResult<()> {
        match self.live.remove(&r) {
            Some(object) => {
                self.freed.insert(r);
                for child in object.owned_children() {
                    // Failures are recorded as violations; keep freeing the rest.
                    let _ = self.free(child);
                }
                Ok(())
            }
            None if self.freed.contains(&r) => {
                self.violations.push(Violation::DoubleFree(r));
                Err(status::INVALID_REF)
            }
            None => Err(self.missing(r)),
        }
    }

    /// Drops objects created by a construction that failed midway.
    fn discard(&mut self, created: &[NativeRef]) {
        for r in created {
            self.live.remove(r);
        }
    }

    fn ntotal(&mut self, r: NativeRef) -> NativeResult<usize> {
        let (_, _, shape) = self.head(r)?;
        match shape {
            Shape::Leaf | Shape::Ivf { .. } => {
                let obj = self.index(r)?;
                Ok(obj.body.store_mut().map_or(0, |s| s.labels.len()))
            }
            Shape::IdMap { .. } => match &self.index(r)?.body {
                Body::IdMap { ids, .. } => Ok(ids.len()),
                _ => Err(FAIL),
            },
            Shape::Refine { base, .. } | Shape::PreTransform { base, .. } => self.ntotal(base),
            Shape::Shards(shards) => {
                let mut total = 0;
                for shard in shards {
                    total += self.ntotal(shard)?;
                }
                Ok(total)
            }
        }
    }

    fn is_trained(&mut self, r: NativeRef) -> NativeResult<bool> {
        let (_, _, shape) = self.head(r)?;
        match shape {
            Shape::Leaf | Shape::Ivf { .. } => Ok(self.index(r)?.trained),
            Shape::IdMap { base } => self.is_trained(base),
            Shape::Refine { base, refine } => Ok(self.is_trained(base)? && self.is_trained(refine)?),
            Shape::PreTransform { transform, base } => {
                Ok(self.transform(transform)?.trained && self.is_trained(base)?)
            }
            Shape::Shards(shards) => {
                for shard in shards {
                    if !self.is_trained(shard)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn apply(&mut self, t: NativeRef, x: &[f32]) -> NativeResult<Vec<f32>> {
        let obj = self.transform(t)?;
        if !obj.trained || x.len() % obj.d_in != 0 {
            return Err(FAIL);
        }
        let (d_in, d_out) = (obj.d_in, obj.d_out);
        let mut out = Vec::with_capacity(x.len() / d_in * d_out);
        for row in x.chunks_exact(d_in) {
            let kept = d_in.min(d_out);
            out.extend_from_slice(&row[..kept]);
            out.extend(std::iter::repeat(0.0).take(d_out - kept));
        }
        Ok(out)
    }

    fn reverse(&mut self, t: NativeRef, xt: &[f32]) -> NativeResult<Vec<f32>> {
        let obj = self.transform(t)?;
        if !obj.trained || xt.len() % obj.d_out != 0 {
            return Err(FAIL);
        }
        let (d_in, d_out) = (obj.d_in, obj.d_out);
        let mut out = Vec::with_capacity(xt.len() / d_out * d_in);
        for row in xt.chunks_exact(d_out) {
            let kept = d_in.min(d_out);
            out.extend_from_slice(&row[..kept]);
            out.extend(std::iter::repeat(0.0).take(d_in - kept));
        }
        Ok(out)
    }

    fn train(&mut self, r: NativeRef, x: &[f32]) -> NativeResult<()> {
        let (d, _, shape) = self.head(r)?;
        if x.len() % d != 0 {
            return Err(FAIL);
        }
        let n = x.len() / d;
        match shape {
            Shape::Leaf => {
                let obj = self.index(r)?;
                if n < obj.min_training.max(1) {
                    return Err(FAIL);
                }
                obj.trained = true;
                Ok(())
            }
            Shape::Ivf { quantizer, nlist } => {
                let min_training = self.index(r)?.min_training;
                if n < nlist.max(min_training) {
                    return Err(FAIL);
                }
                // Centroids go into the coarse quantizer.
                if self.ntotal(quantizer)? == 0 {
                    self.add(quantizer, &x[..nlist * d], None)?;
                }
                self.index(r)?.trained = true;
                Ok(())
            }
            Shape::IdMap { base } => self.train(base, x),
            Shape::Refine { base, refine } => {
                self.train(base, x)?;
                if !self.is_trained(refine)? {
                    self.train(refine, x)?;
                }
                Ok(())
            }
            Shape::PreTransform { transform, base } => {
                let obj = self.transform(transform)?;
                if !obj.trained {
                    obj.trained = true;
                }
                let xt = self.apply(transform, x)?;
                self.train(base, &xt)
            }
            Shape::Shards(shards) => {
                for shard in shards {
                    self.train(shard, x)?;
                }
                Ok(())
            }
        }
    }

    fn add(&mut self, r: NativeRef, x: &[f32], ids: Option<&[i64]>) -> NativeResult<()> {
        let (d, _, shape) = self.head(r)?;
        if x.len() % d != 0 {
            return Err(FAIL);
        }
        let n = x.len() / d;
        if ids.is_some_and(|ids| ids.len() != n) {
            return Err(FAIL);
        }
        match shape {
            Shape::Leaf | Shape::Ivf { .. } => {
                let is_ivf = matches!(shape, Shape::Ivf { .. });
                let obj = self.index(r)?;
                if !obj.trained || (ids.is_some() && !is_ivf) {
                    return Err(FAIL);
                }
                let store = obj.body.store_mut().ok_or(FAIL)?;
                let start = store.labels.len() as i64;
                store.vectors.extend_from_slice(x);
                match ids {
                    Some(ids) => store.labels.extend_from_slice(ids),
                    None => store.labels.extend(start..start + n as i64),
                }
                Ok(())
            }
            Shape::IdMap { base } => {
                // Like the native IDMap, plain add has no ids to record.
                let ids = ids.ok_or(FAIL)?;
                self.add(base, x, None)?;
                match &mut self.index(r)?.body {
                    Body::IdMap { ids: stored, .. } => {
                        stored.extend_from_slice(ids);
                        Ok(())
                    }
                    _ => Err(FAIL),
                }
            }
            Shape::Refine { base, refine } => {
                if ids.is_some() {
                    return Err(FAIL);
                }
                self.add(base, x, None)?;
                self.add(refine, x, None)
            }
            Shape::PreTransform { transform, base } => {
                let xt = self.apply(transform, x)?;
                self.add(base, &xt, ids)
            }
            Shape::Shards(shards) => {
                if ids.is_some() || shards.is_empty() {
                    return Err(FAIL);
                }
                let mut global = self.ntotal(r)? as i64;
                let mut segments = Vec::new();
                for (j, shard) in shards.iter().enumerate() {
                    let i0 = n * j / shards.len();
                    let i1 = n * (j + 1) / shards.len();
                    if i1 == i0 {
                        continue;
                    }
                    let local_start = self.ntotal(*shard)? as i64;
                    self.add(*shard, &x[i0 * d..i1 * d], None)?;
                    segments.push(Segment {
                        shard: j,
                        global_start: global,
                        local_start,
                        count: i1 - i0,
                    });
                    global += (i1 - i0) as i64;
                }
                match &mut self.index(r)?.body {
                    Body::Shards { segments: stored, .. } => {
                        stored.extend(segments);
                        Ok(())
                    }
                    _ => Err(FAIL),
                }
            }
        }
    }

    /// Scores every stored vector against `q`, returning `(label, score)`.
    fn scan(&mut self, r: NativeRef, q: &[f32]) -> NativeResult<Vec<(i64, f32)>> {
        let (_, _, shape) = self.head(r)?;
        match shape {
            Shape::Leaf | Shape::Ivf { .. } => {
                let obj = self.index(r)?;
                if !obj.trained {
                    return Err(FAIL);
                }
                let (d, metric) = (obj.d, obj.metric);
                let store = obj.body.store_mut().ok_or(FAIL)?;
                Ok(store
                    .vectors
                    .chunks_exact(d)
                    .zip(store.labels.iter())
                    .map(|(v, &label)| (label, metric.score(q, v)))
                    .collect())
            }
            Shape::IdMap { base } => {
                let hits = self.scan(base, q)?;
                let ids = match &self.index(r)?.body {
                    Body::IdMap { ids, .. } => ids.clone(),
                    _ => return Err(FAIL),
                };
                Ok(hits
                    .into_iter()
                    .filter_map(|(l, s)| {
                        let id = usize::try_from(l).ok().and_then(|p| ids.get(p))?;
                        Some((*id, s))
                    })
                    .collect())
            }
            Shape::Refine { refine, .. } => self.scan(refine, q),
            Shape::PreTransform { transform, base } => {
                let qt = self.apply(transform, q)?;
                self.scan(base, &qt)
            }
            Shape::Shards(shards) => {
                let segments = match &self.index(r)?.body {
                    Body::Shards { segments, .. } => segments.clone(),
                    _ => return Err(FAIL),
                };
                let mut hits = Vec::new();
                for (j, shard) in shards.iter().enumerate() {
                    for (local, score) in self.scan(*shard, q)? {
                        let global = segments
                            .iter()
                            .find(|s| {
                                s.shard == j
                                    && local >= s.local_start
                                    && local < s.local_start + s.count as i64
                            })
                            .map_or(local, |s| s.global_start + (local - s.local_start));
                        hits.push((global, score));
                    }
                }
                Ok(hits)
            }
        }
    }

    fn reset(&mut self, r: NativeRef) -> NativeResult<()> {
        let (_, _, shape) = self.head(r)?;
        match shape {
            Shape::Leaf | Shape::Ivf { .. } => {
                if let Some(store) = self.index(r)?.body.store_mut() {
                    store.clear();
                }
                Ok(())
            }
            Shape::IdMap { base } => {
                self.reset(base)?;
                if let Body::IdMap { ids, .. } = &mut self.index(r)?.body {
                    ids.clear();
                }
                Ok(())
            }
            Shape::Refine { base, refine } => {
                self.reset(base)?;
                self.reset(refine)
            }
            Shape::PreTransform { base, .. } => self.reset(base),
            Shape::Shards(shards) => {
                for shard in shards {
                    self.reset(shard)?;
                }
                if let Body::Shards { segments, .. } = &mut self.index(r)?.body {
                    segments.clear();
                }
                Ok(())
            }
        }
    }

    fn reconstruct(&mut self, r: NativeRef, key: i64, out: &mut [f32]) -> NativeResult<()> {
        let (d, _, shape) = self.head(r)?;
        if out.len() < d {
            return Err(FAIL);
        }
        match shape {
            Shape::Leaf | Shape::Ivf { .. } => {
                let obj = self.index(r)?;
                if obj.type_name == "IndexLSH" {
                    return Err(FAIL);
                }
                let store = obj.body.store_mut().ok_or(FAIL)?;
                let pos = store.position(key).ok_or(FAIL)?;
                out[..d].copy_from_slice(&store.vectors[pos * d..(pos + 1) * d]);
                Ok(())
            }
            Shape::IdMap { base } => {
                let pos = match &self.index(r)?.body {
                    Body::IdMap { ids, .. } => ids.iter().position(|&id| id == key).ok_or(FAIL)?,
                    _ => return Err(FAIL),
                };
                self.reconstruct(base, pos as i64, out)
            }
            Shape::Refine { refine, .. } => self.reconstruct(refine, key, out),
            Shape::PreTransform { .. } | Shape::Shards(_) => Err(FAIL),
        }
    }

    fn set_parameter(&mut self, r: NativeRef, name: &str, value: f64) -> NativeResult<()> {
        let (_, _, shape) = self.head(r)?;
        match shape {
            Shape::Ivf { .. } if name == "nprobe" => {
                self.index(r)?.params.insert(name.to_string(), value);
                Ok(())
            }
            Shape::Leaf if matches!(name, "efSearch" | "efConstruction") => {
                let obj = self.index(r)?;
                if !obj.is_graph() {
                    return Err(FAIL);
                }
                obj.params.insert(name.to_string(), value);
                Ok(())
            }
            Shape::Refine { .. } if name == "k_factor" => {
                self.index(r)?.params.insert(name.to_string(), value);
                Ok(())
            }
            Shape::Refine { base, .. }
            | Shape::IdMap { base }
            | Shape::PreTransform { base, .. } => self.set_parameter(base, name, value),
            Shape::Shards(shards) if !shards.is_empty() => {
                for shard in shards {
                    self.set_parameter(shard, name, value)?;
                }
                Ok(())
            }
            _ => Err(FAIL),
        }
    }

    fn get_parameter(&mut self, r: NativeRef, name: &str) -> NativeResult<f64> {
        let (_, _, shape) = self.head(r)?;
        let graph = self.index(r)?.is_graph();
        let default = match (&shape, name) {
            (Shape::Ivf { .. }, "nprobe") => Some(1.0),
            (Shape::Leaf, "efSearch") if graph => Some(16.0),
            (Shape::Leaf, "efConstruction") if graph => Some(40.0),
            (Shape::Refine { .. }, "k_factor") => Some(1.0),
            _ => None,
        };
        if let Some(default) = default {
            let obj = self.index(r)?;
            return Ok(obj.params.get(name).copied().unwrap_or(default));
        }
        match shape {
            Shape::Refine { base, .. }
            | Shape::IdMap { base }
            | Shape::PreTransform { base, .. } => self.get_parameter(base, name),
            Shape::Shards(shards) => match shards.first() {
                Some(&first) => self.get_parameter(first, name),
                None => Err(FAIL),
            },
            _ => Err(FAIL),
        }
    }

    fn describe(&mut self, class: NativeClass, r: NativeRef) -> NativeResult<ObjectInfo> {
        match class {
            NativeClass::Index => {
                let ntotal = self.ntotal(r)?;
                let is_trained = self.is_trained(r)?;
                let obj = self.index(r)?;
                let nlist = match obj.body {
                    Body::Ivf { nlist, .. } => Some(nlist),
                    _ => None,
                };
                Ok(ObjectInfo {
                    type_name: obj.type_name.clone(),
                    dimension: obj.d,
                    metric: obj.metric,
                    ntotal,
                    is_trained,
                    nlist,
                    d_out: None,
                })
            }
            NativeClass::BinaryIndex => {
                let obj = self.binary(r)?;
                Ok(ObjectInfo {
                    type_name: obj.type_name.to_string(),
                    dimension: obj.d,
                    metric: MetricType::L2,
                    ntotal: obj.ntotal(),
                    is_trained: obj.trained,
                    nlist: obj.quantizer.map(|_| obj.nlist),
                    d_out: None,
                })
            }
            NativeClass::Transform => {
                let obj = self.transform(r)?;
                Ok(ObjectInfo {
                    type_name: obj.type_name.clone(),
                    dimension: obj.d_in,
                    metric: MetricType::L2,
                    ntotal: 0,
                    is_trained: obj.trained,
                    nlist: None,
                    d_out: Some(obj.d_out),
                })
            }
            NativeClass::Clustering => {
                let obj = self.kmeans(r)?;
                Ok(ObjectInfo {
                    type_name: "Clustering".to_string(),
                    dimension: obj.d,
                    metric: MetricType::L2,
                    ntotal: 0,
                    is_trained: !obj.centroids.is_empty(),
                    nlist: Some(obj.k),
                    d_out: None,
                })
            }
        }
    }

    fn save(&mut self, r: NativeRef) -> NativeResult<Saved> {
        if let Some(Object::Transform(obj)) = self.live.get(&r) {
            return Ok(Saved::Transform(obj.clone()));
        }
        let obj = self.index(r)?.clone();
        let body = match obj.body {
            Body::Leaf(store) => SavedBody::Leaf(store),
            Body::Ivf {
                quantizer,
                nlist,
                store,
            } => SavedBody::Ivf {
                quantizer: Box::new(self.save(quantizer)?),
                nlist,
                store,
            },
            Body::IdMap { base, ids } => SavedBody::IdMap {
                base: Box::new(self.save(base)?),
                ids,
            },
            Body::Refine { base, refine } => SavedBody::Refine {
                base: Box::new(self.save(base)?),
                refine: Box::new(self.save(refine)?),
            },
            Body::PreTransform { transform, base } => SavedBody::PreTransform {
                transform: Box::new(self.save(transform)?),
                base: Box::new(self.save(base)?),
            },
            Body::Shards { shards, segments } => {
                let mut saved = Vec::with_capacity(shards.len());
                for shard in shards {
                    saved.push(self.save(shard)?);
                }
                SavedBody::Shards {
                    shards: saved,
                    segments,
                }
            }
        };
        Ok(Saved::Index {
            type_name: obj.type_name,
            d: obj.d,
            metric: obj.metric,
            trained: obj.trained,
            min_training: obj.min_training,
            params: obj.params,
            body,
        })
    }

    /// Rebuilds a saved tree. Loaded composites own their children.
    fn restore(&mut self, saved: Saved) -> NativeRef {
        let (type_name, d, metric, trained, min_training, params, body) = match saved {
            Saved::Transform(obj) => return self.insert(Object::Transform(obj)),
            Saved::Index {
                type_name,
                d,
                metric,
                trained,
                min_training,
                params,
                body,
            } => (type_name, d, metric, trained, min_training, params, body),
        };
        let body = match body {
            SavedBody::Leaf(store) => Body::Leaf(store),
            SavedBody::Ivf {
                quantizer,
                nlist,
                store,
            } => Body::Ivf {
                quantizer: self.restore(*quantizer),
                nlist,
                store,
            },
            SavedBody::IdMap { base, ids } => Body::IdMap {
                base: self.restore(*base),
                ids,
            },
            SavedBody::Refine { base, refine } => Body::Refine {
                base: self.restore(*base),
                refine: self.restore(*refine),
            },
            SavedBody::PreTransform { transform, base } => Body::PreTransform {
                transform: self.restore(*transform),
                base: self.restore(*base),
            },
            SavedBody::Shards { shards, segments } => Body::Shards {
                shards: shards.into_iter().map(|s| self.restore(s)).collect(),
                segments,
            },
        };
        let own_fields = !body.children().is_empty();
        self.insert(Object::Index(IndexObject {
            type_name,
            d,
            metric,
            trained,
            min_training,
            own_fields,
            params,
            body,
        }))
    }

    fn build_transform(&mut self, d: usize, stage: &TransformStage) -> NativeResult<(NativeRef, usize)> {
        let (type_name, d_out) = match *stage {
            TransformStage::Pca { d_out, .. } if d_out > 0 && d_out <= d => ("PCAMatrix", d_out),
            TransformStage::Opq { m, d_out } if m > 0 && d % m == 0 => {
                ("OPQMatrix", d_out.unwrap_or(d))
            }
            TransformStage::RandomRotation { d_out } if d_out > 0 => {
                ("RandomRotationMatrix", d_out)
            }
            _ => return Err(FAIL),
        };
        let r = self.insert(Object::Transform(TransformObject {
            type_name: type_name.to_string(),
            d_in: d,
            d_out,
            trained: false,
        }));
        Ok((r, d_out))
    }

    fn build_core(
        &mut self,
        d: usize,
        core: &CoreStage,
        metric: MetricType,
        created: &mut Vec<NativeRef>,
    ) -> NativeResult<NativeRef> {
        let object = match *core {
            CoreStage::Flat => flat_object(d, metric),
            CoreStage::Hnsw { m } if m > 0 => IndexObject::leaf("IndexHNSWFlat", d, metric, 0),
            CoreStage::Pq { m, nbits } => pq_object(d, m, nbits, metric)?,
            CoreStage::Sq(qtype) => sq_object(d, qtype, metric),
            CoreStage::Lsh => IndexObject::leaf("IndexLSH", d, metric, 0),
            CoreStage::Ivf { nlist, storage } if nlist > 0 => {
                let quantizer = self.insert(Object::Index(flat_object(d, metric)));
                created.push(quantizer);
                let (type_name, min_training) = match storage {
                    IvfStorage::Flat => ("IndexIVFFlat", 0),
                    IvfStorage::Pq { m, nbits } => {
                        pq_object(d, m, nbits, metric)?;
                        ("IndexIVFPQ", 1usize << nbits)
                    }
                    IvfStorage::Sq(_) => ("IndexIVFScalarQuantizer", 0),
                };
                let mut obj = ivf_object(type_name, quantizer, d, nlist, metric);
                obj.min_training = min_training;
                obj.own_fields = true;
                obj
            }
            _ => return Err(FAIL),
        };
        let r = self.insert(Object::Index(object));
        created.push(r);
        Ok(r)
    }

    fn build_factory(
        &mut self,
        d: usize,
        desc: &PipelineDescriptor,
        metric: MetricType,
        created: &mut Vec<NativeRef>,
    ) -> NativeResult<NativeRef> {
        let mut dim = d;
        let mut transforms = Vec::new();
        for stage in desc.transforms() {
            let (t, d_out) = self.build_transform(dim, stage)?;
            created.push(t);
            transforms.push((t, dim));
            dim = d_out;
        }

        let mut root = self.build_core(dim, desc.core(), metric, created)?;
        if desc.has_refinement() {
            let refine = self.insert(Object::Index(flat_object(dim, metric)));
            created.push(refine);
            let mut obj =
                IndexObject::composite("IndexRefine", dim, metric, Body::Refine { base: root, refine });
            obj.own_fields = true;
            root = self.insert(Object::Index(obj));
            created.push(root);
        }
        for (transform, d_in) in transforms.into_iter().rev() {
            let mut obj = IndexObject::composite(
                "IndexPreTransform",
                d_in,
                metric,
                Body::PreTransform {
                    transform,
                    base: root,
                },
            );
            obj.own_fields = true;
            root = self.insert(Object::Index(obj));
            created.push(root);
        }
        if desc.has_id_map() {
            let mut obj = IndexObject::composite(
                "IndexIDMap",
                d,
                metric,
                Body::IdMap {
                    base: root,
                    ids: Vec::new(),
                },
            );
            obj.own_fields = true;
            root = self.insert(Object::Index(obj));
            created.push(root);
        }
        Ok(root)
    }
}

fn flat_object(d: usize, metric: MetricType) -> IndexObject {
    let type_name = match metric {
        MetricType::L2 => "IndexFlatL2",
        MetricType::InnerProduct => "IndexFlatIP",
    };
    IndexObject::leaf(type_name, d, metric, 0)
}

fn pq_object(d: usize, m: usize, nbits: usize, metric: MetricType) -> NativeResult<IndexObject> {
    if m == 0 || d % m != 0 || !(1..=16).contains(&nbits) {
        return Err(FAIL);
    }
    Ok(IndexObject::leaf("IndexPQ", d, metric, 1 << nbits))
}

fn sq_object(d: usize, qtype: QuantizerType, metric: MetricType) -> IndexObject {
    let min_training = usize::from(qtype.requires_training());
    IndexObject::leaf("IndexScalarQuantizer", d, metric, min_training)
}

fn ivf_object(
    type_name: &str,
    quantizer: NativeRef,
    d: usize,
    nlist: usize,
    metric: MetricType,
) -> IndexObject {
    IndexObject::composite(
        type_name,
        d,
        metric,
        Body::Ivf {
            quantizer,
            nlist,
            store: Store::default(),
        },
    )
}

fn rank(metric: MetricType) -> impl Fn(&(i64, f32), &(i64, f32)) -> Ordering {
    move |a, b| match metric {
        MetricType::L2 => a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal),
        MetricType::InnerProduct => b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal),
    }
}

fn frame(saved: &Saved) -> NativeResult<Vec<u8>> {
    let json = serde_json::to_vec(saved).map_err(|_| FAIL)?;
    let length = u32::try_from(json.len()).map_err(|_| FAIL)?;
    let mut out = Vec::with_capacity(json.len() + 8);
    out.extend_from_slice(&crc32fast::hash(&json).to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

fn unframe(bytes: &[u8]) -> NativeResult<Saved> {
    let word = |at: usize| -> NativeResult<u32> {
        let raw = bytes.get(at..at + 4).ok_or(FAIL)?;
        Ok(u32::from_le_bytes(raw.try_into().map_err(|_| FAIL)?))
    };
    let checksum = word(0)?;
    let length = word(4)? as usize;
    let data = bytes.get(8..8 + length).ok_or(FAIL)?;
    if crc32fast::hash(data) != checksum {
        return Err(FAIL);
    }
    serde_json::from_slice(data).map_err(|_| FAIL)
}

impl NativeEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn set_num_threads(&self, threads: usize) -> NativeResult<()> {
        let _registry = self.enter("set_num_threads")?;
        self.threads.store(threads, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn index_flat_new(&self, d: usize, metric: MetricType) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_flat_new")?;
        if d == 0 {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Index(flat_object(d, metric))))
    }

    fn index_ivf_flat_new(
        &self,
        quantizer: NativeRef,
        d: usize,
        nlist: usize,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_ivf_flat_new")?;
        if nlist == 0 || reg.index(quantizer)?.d != d {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Index(ivf_object(
            "IndexIVFFlat",
            quantizer,
            d,
            nlist,
            metric,
        ))))
    }

    fn index_ivf_pq_new(
        &self,
        quantizer: NativeRef,
        d: usize,
        nlist: usize,
        m: usize,
        nbits: usize,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_ivf_pq_new")?;
        if nlist == 0 || reg.index(quantizer)?.d != d {
            return Err(FAIL);
        }
        pq_object(d, m, nbits, metric)?;
        let mut obj = ivf_object("IndexIVFPQ", quantizer, d, nlist, metric);
        obj.min_training = 1 << nbits;
        Ok(reg.insert(Object::Index(obj)))
    }

    fn index_ivf_sq_new(
        &self,
        quantizer: NativeRef,
        d: usize,
        nlist: usize,
        _qtype: QuantizerType,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_ivf_sq_new")?;
        if nlist == 0 || reg.index(quantizer)?.d != d {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Index(ivf_object(
            "IndexIVFScalarQuantizer",
            quantizer,
            d,
            nlist,
            metric,
        ))))
    }

    fn index_hnsw_flat_new(
        &self,
        d: usize,
        m: usize,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_hnsw_flat_new")?;
        if d == 0 || m == 0 {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Index(IndexObject::leaf(
            "IndexHNSWFlat",
            d,
            metric,
            0,
        ))))
    }

    fn index_pq_new(
        &self,
        d: usize,
        m: usize,
        nbits: usize,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_pq_new")?;
        let obj = pq_object(d, m, nbits, metric)?;
        Ok(reg.insert(Object::Index(obj)))
    }

    fn index_sq_new(
        &self,
        d: usize,
        qtype: QuantizerType,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_sq_new")?;
        if d == 0 {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Index(sq_object(d, qtype, metric))))
    }

    fn index_lsh_new(
        &self,
        d: usize,
        nbits: usize,
        _rotate_data: bool,
        train_thresholds: bool,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_lsh_new")?;
        if d == 0 || nbits == 0 {
            return Err(FAIL);
        }
        let min_training = usize::from(train_thresholds);
        Ok(reg.insert(Object::Index(IndexObject::leaf(
            "IndexLSH",
            d,
            MetricType::L2,
            min_training,
        ))))
    }

    fn index_idmap_new(&self, base: NativeRef) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_idmap_new")?;
        let (d, metric) = {
            let obj = reg.index(base)?;
            (obj.d, obj.metric)
        };
        if reg.ntotal(base)? != 0 {
            return Err(FAIL);
        }
        let body = Body::IdMap {
            base,
            ids: Vec::new(),
        };
        Ok(reg.insert(Object::Index(IndexObject::composite(
            "IndexIDMap",
            d,
            metric,
            body,
        ))))
    }

    fn index_refine_new(&self, base: NativeRef, refine: NativeRef) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_refine_new")?;
        let (d, metric) = {
            let obj = reg.index(base)?;
            (obj.d, obj.metric)
        };
        if reg.index(refine)?.d != d {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Index(IndexObject::composite(
            "IndexRefine",
            d,
            metric,
            Body::Refine { base, refine },
        ))))
    }

    fn index_pretransform_new(
        &self,
        transform: NativeRef,
        base: NativeRef,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_pretransform_new")?;
        let (d_in, d_out) = {
            let t = reg.transform(transform)?;
            (t.d_in, t.d_out)
        };
        let (d, metric) = {
            let obj = reg.index(base)?;
            (obj.d, obj.metric)
        };
        if d != d_out {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Index(IndexObject::composite(
            "IndexPreTransform",
            d_in,
            metric,
            Body::PreTransform { transform, base },
        ))))
    }

    fn index_shards_new(&self, d: usize, metric: MetricType) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_shards_new")?;
        if d == 0 {
            return Err(FAIL);
        }
        let body = Body::Shards {
            shards: Vec::new(),
            segments: Vec::new(),
        };
        Ok(reg.insert(Object::Index(IndexObject::composite(
            "IndexShards",
            d,
            metric,
            body,
        ))))
    }

    fn index_shards_add_shard(&self, shards: NativeRef, shard: NativeRef) -> NativeResult<()> {
        let mut reg = self.enter("index_shards_add_shard")?;
        let d = reg.index(shard)?.d;
        let obj = reg.index(shards)?;
        if obj.d != d {
            return Err(FAIL);
        }
        match &mut obj.body {
            Body::Shards { shards, .. } => {
                shards.push(shard);
                Ok(())
            }
            _ => Err(FAIL),
        }
    }

    fn index_factory(
        &self,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("index_factory")?;
        if d == 0 {
            return Err(FAIL);
        }
        let desc = PipelineDescriptor::parse(description).map_err(|_| FAIL)?;
        let mut created = Vec::new();
        let result = reg.build_factory(d, &desc, metric, &mut created);
        if result.is_err() {
            reg.discard(&created);
        }
        result
    }

    fn binary_flat_new(&self, d: usize) -> NativeResult<NativeRef> {
        let mut reg = self.enter("binary_flat_new")?;
        if d == 0 || d % 8 != 0 {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Binary(BinaryObject {
            type_name: "IndexBinaryFlat",
            d,
            trained: true,
            own_fields: false,
            codes: Vec::new(),
            quantizer: None,
            nlist: 0,
        })))
    }

    fn binary_ivf_new(
        &self,
        quantizer: NativeRef,
        d: usize,
        nlist: usize,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("binary_ivf_new")?;
        if d == 0 || d % 8 != 0 || nlist == 0 || reg.binary(quantizer)?.d != d {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Binary(BinaryObject {
            type_name: "IndexBinaryIVF",
            d,
            trained: false,
            own_fields: false,
            codes: Vec::new(),
            quantizer: Some(quantizer),
            nlist,
        })))
    }

    fn binary_hash_new(&self, d: usize, nbits: usize) -> NativeResult<NativeRef> {
        let mut reg = self.enter("binary_hash_new")?;
        if d == 0 || d % 8 != 0 || nbits == 0 || nbits > d {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Binary(BinaryObject {
            type_name: "IndexBinaryHash",
            d,
            trained: true,
            own_fields: false,
            codes: Vec::new(),
            quantizer: None,
            nlist: 0,
        })))
    }

    fn pca_matrix_new(
        &self,
        d_in: usize,
        d_out: usize,
        _eigen_power: f32,
        _random_rotation: bool,
    ) -> NativeResult<NativeRef> {
        let mut reg = self.enter("pca_matrix_new")?;
        if d_out == 0 || d_out > d_in {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Transform(TransformObject {
            type_name: "PCAMatrix".to_string(),
            d_in,
            d_out,
            trained: false,
        })))
    }

    fn opq_matrix_new(&self, d: usize, m: usize) -> NativeResult<NativeRef> {
        let mut reg = self.enter("opq_matrix_new")?;
        if m == 0 || d % m != 0 {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Transform(TransformObject {
            type_name: "OPQMatrix".to_string(),
            d_in: d,
            d_out: d,
            trained: false,
        })))
    }

    fn random_rotation_new(&self, d_in: usize, d_out: usize) -> NativeResult<NativeRef> {
        let mut reg = self.enter("random_rotation_new")?;
        if d_in == 0 || d_out == 0 {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Transform(TransformObject {
            type_name: "RandomRotationMatrix".to_string(),
            d_in,
            d_out,
            trained: false,
        })))
    }

    fn train(&self, index: NativeRef, n: usize, x: &[f32]) -> NativeResult<()> {
        let mut reg = self.enter("train")?;
        let d = reg.index(index)?.d;
        if x.len() != n * d {
            return Err(FAIL);
        }
        reg.train(index, x)
    }

    fn add(&self, index: NativeRef, n: usize, x: &[f32]) -> NativeResult<()> {
        let mut reg = self.enter("add")?;
        let d = reg.index(index)?.d;
        if x.len() != n * d {
            return Err(FAIL);
        }
        reg.add(index, x, None)
    }

    fn add_with_ids(
        &self,
        index: NativeRef,
        n: usize,
        x: &[f32],
        ids: &[i64],
    ) -> NativeResult<()> {
        let mut reg = self.enter("add_with_ids")?;
        let d = reg.index(index)?.d;
        if x.len() != n * d || ids.len() != n {
            return Err(FAIL);
        }
        reg.add(index, x, Some(ids))
    }

    fn reset(&self, index: NativeRef) -> NativeResult<()> {
        let mut reg = self.enter("reset")?;
        reg.reset(index)
    }

    fn set_parameter(&self, index: NativeRef, name: &str, value: f64) -> NativeResult<()> {
        let mut reg = self.enter("set_parameter")?;
        reg.set_parameter(index, name, value)
    }

    fn get_parameter(&self, index: NativeRef, name: &str) -> NativeResult<f64> {
        let mut reg = self.enter("get_parameter")?;
        reg.get_parameter(index, name)
    }

    fn search(
        &self,
        index: NativeRef,
        n: usize,
        x: &[f32],
        k: usize,
        distances: &mut [f32],
        labels: &mut [i64],
    ) -> NativeResult<()> {
        let mut reg = self.enter("search")?;
        let (d, metric, _) = reg.head(index)?;
        if k == 0 || x.len() != n * d || distances.len() < n * k || labels.len() < n * k {
            return Err(FAIL);
        }
        for (qi, q) in x.chunks_exact(d).enumerate() {
            let mut hits = reg.scan(index, q)?;
            hits.sort_by(rank(metric));
            for j in 0..k {
                let slot = qi * k + j;
                match hits.get(j) {
                    Some(&(label, score)) => {
                        labels[slot] = label;
                        distances[slot] = score;
                    }
                    None => {
                        labels[slot] = -1;
                        distances[slot] = metric.sentinel();
                    }
                }
            }
        }
        Ok(())
    }

    fn assign(
        &self,
        index: NativeRef,
        n: usize,
        x: &[f32],
        labels: &mut [i64],
    ) -> NativeResult<()> {
        let mut reg = self.enter("assign")?;
        let (d, metric, _) = reg.head(index)?;
        if x.len() != n * d || labels.len() < n {
            return Err(FAIL);
        }
        for (qi, q) in x.chunks_exact(d).enumerate() {
            let mut hits = reg.scan(index, q)?;
            hits.sort_by(rank(metric));
            labels[qi] = hits.first().map_or(-1, |h| h.0);
        }
        Ok(())
    }

    fn reconstruct(&self, index: NativeRef, key: i64, out: &mut [f32]) -> NativeResult<()> {
        let mut reg = self.enter("reconstruct")?;
        reg.reconstruct(index, key, out)
    }

    fn reconstruct_n(
        &self,
        index: NativeRef,
        start: i64,
        n: usize,
        out: &mut [f32],
    ) -> NativeResult<()> {
        let mut reg = self.enter("reconstruct_n")?;
        let d = reg.index(index)?.d;
        if out.len() < n * d {
            return Err(FAIL);
        }
        for (i, row) in out.chunks_exact_mut(d).take(n).enumerate() {
            reg.reconstruct(index, start + i as i64, row)?;
        }
        Ok(())
    }

    fn range_result_new(&self, nq: usize) -> NativeResult<NativeRef> {
        let mut reg = self.enter("range_result_new")?;
        Ok(reg.insert(Object::Range(RangeObject {
            nq,
            offsets: vec![0; nq + 1],
            labels: Vec::new(),
            distances: Vec::new(),
        })))
    }

    fn range_search(
        &self,
        index: NativeRef,
        n: usize,
        x: &[f32],
        radius: f32,
        result: NativeRef,
    ) -> NativeResult<()> {
        let mut reg = self.enter("range_search")?;
        let (d, metric, _) = reg.head(index)?;
        if x.len() != n * d || reg.range(result)?.nq != n {
            return Err(FAIL);
        }
        let mut offsets = Vec::with_capacity(n + 1);
        let mut labels = Vec::new();
        let mut distances = Vec::new();
        offsets.push(0);
        for q in x.chunks_exact(d) {
            let mut hits = reg.scan(index, q)?;
            hits.retain(|h| metric.within_radius(h.1, radius));
            hits.sort_by(rank(metric));
            for (label, score) in hits {
                labels.push(label);
                distances.push(score);
            }
            offsets.push(labels.len());
        }
        let container = reg.range(result)?;
        container.offsets = offsets;
        container.labels = labels;
        container.distances = distances;
        Ok(())
    }

    fn range_result_size(&self, result: NativeRef) -> NativeResult<usize> {
        let mut reg = self.enter("range_result_size")?;
        Ok(reg.range(result)?.labels.len())
    }

    fn range_result_copy(
        &self,
        result: NativeRef,
        offsets: &mut [usize],
        labels: &mut [i64],
        distances: &mut [f32],
    ) -> NativeResult<()> {
        let mut reg = self.enter("range_result_copy")?;
        let container = reg.range(result)?;
        if offsets.len() != container.offsets.len()
            || labels.len() != container.labels.len()
            || distances.len() != container.distances.len()
        {
            return Err(FAIL);
        }
        offsets.copy_from_slice(&container.offsets);
        labels.copy_from_slice(&container.labels);
        distances.copy_from_slice(&container.distances);
        Ok(())
    }

    fn range_result_free(&self, result: NativeRef) -> NativeResult<()> {
        let mut reg = self.enter("range_result_free")?;
        reg.range(result)?;
        reg.free(result)
    }

    fn binary_train(&self, index: NativeRef, n: usize, x: &[u8]) -> NativeResult<()> {
        let mut reg = self.enter("binary_train")?;
        let obj = reg.binary(index)?;
        let code_size = obj.code_size();
        if x.len() != n * code_size {
            return Err(FAIL);
        }
        let (quantizer, nlist) = match obj.quantizer {
            None => {
                obj.trained = true;
                return Ok(());
            }
            Some(q) => (q, obj.nlist),
        };
        if n < nlist {
            return Err(FAIL);
        }
        let centroids = reg.binary(quantizer)?;
        if centroids.codes.is_empty() {
            centroids.codes.extend_from_slice(&x[..nlist * code_size]);
        }
        reg.binary(index)?.trained = true;
        Ok(())
    }

    fn binary_add(&self, index: NativeRef, n: usize, x: &[u8]) -> NativeResult<()> {
        let mut reg = self.enter("binary_add")?;
        let obj = reg.binary(index)?;
        if !obj.trained || x.len() != n * obj.code_size() {
            return Err(FAIL);
        }
        obj.codes.extend_from_slice(x);
        Ok(())
    }

    fn binary_search(
        &self,
        index: NativeRef,
        n: usize,
        x: &[u8],
        k: usize,
        distances: &mut [i32],
        labels: &mut [i64],
    ) -> NativeResult<()> {
        let mut reg = self.enter("binary_search")?;
        let obj = reg.binary(index)?;
        let code_size = obj.code_size();
        if !obj.trained
            || k == 0
            || x.len() != n * code_size
            || distances.len() < n * k
            || labels.len() < n * k
        {
            return Err(FAIL);
        }
        for (qi, q) in x.chunks_exact(code_size).enumerate() {
            let mut hits: Vec<(i64, i32)> = obj
                .codes
                .chunks_exact(code_size)
                .enumerate()
                .map(|(i, code)| (i as i64, hamming(q, code)))
                .collect();
            hits.sort_by_key(|h| h.1);
            for j in 0..k {
                let slot = qi * k + j;
                let (label, distance) = hits.get(j).copied().unwrap_or((-1, i32::MAX));
                labels[slot] = label;
                distances[slot] = distance;
            }
        }
        Ok(())
    }

    fn binary_reset(&self, index: NativeRef) -> NativeResult<()> {
        let mut reg = self.enter("binary_reset")?;
        reg.binary(index)?.codes.clear();
        Ok(())
    }

    fn transform_train(&self, transform: NativeRef, n: usize, x: &[f32]) -> NativeResult<()> {
        let mut reg = self.enter("transform_train")?;
        let obj = reg.transform(transform)?;
        if n == 0 || x.len() != n * obj.d_in {
            return Err(FAIL);
        }
        obj.trained = true;
        Ok(())
    }

    fn transform_apply(
        &self,
        transform: NativeRef,
        n: usize,
        x: &[f32],
        out: &mut [f32],
    ) -> NativeResult<()> {
        let mut reg = self.enter("transform_apply")?;
        let xt = reg.apply(transform, x)?;
        if out.len() != xt.len() || x.len() / reg.transform(transform)?.d_in != n {
            return Err(FAIL);
        }
        out.copy_from_slice(&xt);
        Ok(())
    }

    fn transform_reverse(
        &self,
        transform: NativeRef,
        n: usize,
        xt: &[f32],
        out: &mut [f32],
    ) -> NativeResult<()> {
        let mut reg = self.enter("transform_reverse")?;
        let x = reg.reverse(transform, xt)?;
        if out.len() != x.len() || xt.len() / reg.transform(transform)?.d_out != n {
            return Err(FAIL);
        }
        out.copy_from_slice(&x);
        Ok(())
    }

    fn kmeans_new(&self, d: usize, k: usize) -> NativeResult<NativeRef> {
        let mut reg = self.enter("kmeans_new")?;
        if d == 0 || k == 0 {
            return Err(FAIL);
        }
        Ok(reg.insert(Object::Kmeans(KmeansObject {
            d,
            k,
            niter: KMEANS_NITER,
            seed: KMEANS_SEED,
            centroids: Vec::new(),
        })))
    }

    fn kmeans_set_niter(&self, kmeans: NativeRef, niter: usize) -> NativeResult<()> {
        let mut reg = self.enter("kmeans_set_niter")?;
        let obj = reg.kmeans(kmeans)?;
        if niter == 0 {
            return Err(FAIL);
        }
        obj.niter = niter;
        Ok(())
    }

    fn kmeans_set_seed(&self, kmeans: NativeRef, seed: u64) -> NativeResult<()> {
        let mut reg = self.enter("kmeans_set_seed")?;
        reg.kmeans(kmeans)?.seed = seed;
        Ok(())
    }

    fn kmeans_train(&self, kmeans: NativeRef, n: usize, x: &[f32]) -> NativeResult<()> {
        let mut reg = self.enter("kmeans_train")?;
        let obj = reg.kmeans(kmeans)?;
        if n < obj.k || x.len() != n * obj.d {
            return Err(FAIL);
        }
        obj.train(x);
        Ok(())
    }

    fn kmeans_centroids(&self, kmeans: NativeRef, out: &mut [f32]) -> NativeResult<()> {
        let mut reg = self.enter("kmeans_centroids")?;
        let obj = reg.kmeans(kmeans)?;
        if obj.centroids.is_empty() || out.len() != obj.centroids.len() {
            return Err(FAIL);
        }
        out.copy_from_slice(&obj.centroids);
        Ok(())
    }

    fn kmeans_assign(
        &self,
        kmeans: NativeRef,
        n: usize,
        x: &[f32],
        labels: &mut [i64],
    ) -> NativeResult<()> {
        let mut reg = self.enter("kmeans_assign")?;
        let obj = reg.kmeans(kmeans)?;
        if obj.centroids.is_empty() || x.len() != n * obj.d || labels.len() < n {
            return Err(FAIL);
        }
        for (label, v) in labels.iter_mut().zip(x.chunks_exact(obj.d)) {
            *label = obj.nearest(v) as i64;
        }
        Ok(())
    }

    fn free(&self, class: NativeClass, object: NativeRef) -> NativeResult<()> {
        let mut reg = self.enter("free")?;
        if let Some(found) = reg.live.get(&object).map(Object::class) {
            if found != Some(class) {
                return Err(FAIL);
            }
        }
        reg.free(object)
    }

    fn set_own_fields(&self, object: NativeRef, own: bool) -> NativeResult<()> {
        let mut reg = self.enter("set_own_fields")?;
        if !reg.live.contains_key(&object) {
            return Err(reg.missing(object));
        }
        match reg.live.get_mut(&object) {
            Some(Object::Index(obj)) if !matches!(obj.body, Body::Leaf(_)) => {
                obj.own_fields = own;
                Ok(())
            }
            Some(Object::Binary(obj)) if obj.quantizer.is_some() => {
                obj.own_fields = own;
                Ok(())
            }
            _ => Err(FAIL),
        }
    }

    fn describe(&self, class: NativeClass, object: NativeRef) -> NativeResult<ObjectInfo> {
        let mut reg = self.enter("describe")?;
        reg.describe(class, object)
    }

    fn write_index(&self, index: NativeRef, path: &Path) -> NativeResult<()> {
        let mut reg = self.enter("write_index")?;
        let bytes = frame(&reg.save(index)?)?;
        fs::write(path, bytes).map_err(|_| FAIL)
    }

    fn read_index(&self, path: &Path) -> NativeResult<NativeRef> {
        let mut reg = self.enter("read_index")?;
        let bytes = fs::read(path).map_err(|_| FAIL)?;
        let saved = unframe(&bytes)?;
        Ok(reg.restore(saved))
    }

    fn serialize_index(&self, index: NativeRef) -> NativeResult<Vec<u8>> {
        let mut reg = self.enter("serialize_index")?;
        let saved = reg.save(index)?;
        frame(&saved)
    }

    fn deserialize_index(&self, bytes: &[u8]) -> NativeResult<NativeRef> {
        let mut reg = self.enter("deserialize_index")?;
        let saved = unframe(bytes)?;
        Ok(reg.restore(saved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_with(engine: &MockEngine, data: &[f32], d: usize) -> NativeRef {
        let index = engine.index_flat_new(d, MetricType::L2).unwrap();
        engine.add(index, data.len() / d, data).unwrap();
        index
    }

    #[test]
    fn test_flat_search_pads_missing_neighbors() {
        let engine = MockEngine::new();
        let index = flat_with(&engine, &[0.0, 0.0, 3.0, 4.0], 2);

        let mut distances = [0.0f32; 3];
        let mut labels = [0i64; 3];
        engine
            .search(index, 1, &[0.0, 0.0], 3, &mut distances, &mut labels)
            .unwrap();

        assert_eq!(labels, [0, 1, -1]);
        assert_eq!(distances[1], 25.0);
        assert_eq!(distances[2], f32::INFINITY);
    }

    #[test]
    fn test_double_free_is_recorded() {
        let engine = MockEngine::new();
        let index = engine.index_flat_new(4, MetricType::L2).unwrap();

        assert!(engine.free(NativeClass::Index, index).is_ok());
        assert_eq!(
            engine.free(NativeClass::Index, index),
            Err(status::INVALID_REF)
        );
        assert_eq!(engine.violations(), vec![Violation::DoubleFree(index)]);
    }

    #[test]
    fn test_use_after_free_is_recorded() {
        let engine = MockEngine::new();
        let index = engine.index_flat_new(2, MetricType::L2).unwrap();
        engine.free(NativeClass::Index, index).unwrap();

        assert!(engine.add(index, 1, &[1.0, 2.0]).is_err());
        assert_eq!(
            engine.violations(),
            vec![Violation::UseAfterFree {
                function: "add",
                object: index
            }]
        );
    }

    #[test]
    fn test_own_fields_controls_child_free() {
        let engine = MockEngine::new();
        let base = engine.index_flat_new(2, MetricType::L2).unwrap();
        let idmap = engine.index_idmap_new(base).unwrap();
        assert_eq!(engine.own_fields(idmap), Some(false));

        engine.free(NativeClass::Index, idmap).unwrap();
        assert!(engine.is_live(base));

        let idmap = engine.index_idmap_new(base).unwrap();
        engine.set_own_fields(idmap, true).unwrap();
        engine.free(NativeClass::Index, idmap).unwrap();
        assert!(!engine.is_live(base));
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_ivf_training_fills_quantizer() {
        let engine = MockEngine::new();
        let quantizer = engine.index_flat_new(2, MetricType::L2).unwrap();
        let ivf = engine
            .index_ivf_flat_new(quantizer, 2, 4, MetricType::L2)
            .unwrap();

        assert_eq!(engine.add(ivf, 1, &[0.0, 0.0]), Err(FAIL));
        assert_eq!(engine.train(ivf, 2, &[0.0; 4]), Err(FAIL));

        let data: Vec<f32> = (0..16).map(|x| x as f32).collect();
        engine.train(ivf, 8, &data).unwrap();
        let info = engine.describe(NativeClass::Index, quantizer).unwrap();
        assert_eq!(info.ntotal, 4);
        assert!(engine
            .describe(NativeClass::Index, ivf)
            .unwrap()
            .is_trained);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let engine = MockEngine::new();
        engine.fail_next("index_flat_new", -7);
        assert_eq!(engine.index_flat_new(2, MetricType::L2), Err(-7));
        assert!(engine.index_flat_new(2, MetricType::L2).is_ok());
        assert_eq!(engine.calls("index_flat_new"), 2);
    }

    #[test]
    fn test_factory_builds_owned_tree() {
        let engine = MockEngine::new();
        let index = engine
            .index_factory(8, "PCA4,IVF2,Flat", MetricType::L2)
            .unwrap();
        let info = engine.describe(NativeClass::Index, index).unwrap();
        assert_eq!(info.type_name, "IndexPreTransform");
        assert_eq!(info.dimension, 8);
        assert!(!info.is_trained);
        // transform, quantizer, ivf, pretransform
        assert_eq!(engine.live_objects(), 4);

        engine.free(NativeClass::Index, index).unwrap();
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.violations().is_empty());

        assert_eq!(engine.index_factory(8, "IVF,Flat", MetricType::L2), Err(FAIL));
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_serialize_round_trip_and_corruption() {
        let engine = MockEngine::new();
        let index = flat_with(&engine, &[1.0, 2.0, 3.0, 4.0], 2);

        let mut bytes = engine.serialize_index(index).unwrap();
        let copy = engine.deserialize_index(&bytes).unwrap();
        let info = engine.describe(NativeClass::Index, copy).unwrap();
        assert_eq!(info.ntotal, 2);
        assert_eq!(info.type_name, "IndexFlatL2");

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert_eq!(engine.deserialize_index(&bytes), Err(FAIL));
    }

    #[test]
    fn test_range_result_protocol() {
        let engine = MockEngine::new();
        let index = flat_with(&engine, &[0.0, 0.0, 1.0, 0.0, 5.0, 5.0], 2);
        let result = engine.range_result_new(1).unwrap();
        engine
            .range_search(index, 1, &[0.0, 0.0], 2.0, result)
            .unwrap();

        let total = engine.range_result_size(result).unwrap();
        assert_eq!(total, 2);
        let mut offsets = vec![0; 2];
        let mut labels = vec![0; total];
        let mut distances = vec![0.0; total];
        engine
            .range_result_copy(result, &mut offsets, &mut labels, &mut distances)
            .unwrap();
        assert_eq!(offsets, vec![0, 2]);
        assert_eq!(labels, vec![0, 1]);

        engine.range_result_free(result).unwrap();
        assert!(!engine.is_live(result));
    }

    #[test]
    fn test_binary_hamming_search() {
        let engine = MockEngine::new();
        let index = engine.binary_flat_new(16).unwrap();
        engine
            .binary_add(index, 2, &[0x00, 0x00, 0xff, 0xff])
            .unwrap();

        let mut distances = [0i32; 2];
        let mut labels = [0i64; 2];
        engine
            .binary_search(index, 1, &[0x0f, 0xff], 2, &mut distances, &mut labels)
            .unwrap();
        assert_eq!(labels, [1, 0]);
        assert_eq!(distances, [4, 12]);
    }

    #[test]
    fn test_kmeans_lloyd_iterations() {
        let engine = MockEngine::new();
        let km = engine.kmeans_new(2, 2).unwrap();
        let data = [0.0, 0.0, 0.0, 1.0, 10.0, 10.0, 10.0, 11.0];

        let mut centroids = [0.0f32; 4];
        assert_eq!(engine.kmeans_centroids(km, &mut centroids), Err(FAIL));
        assert_eq!(engine.kmeans_train(km, 1, &data[..2]), Err(FAIL));

        // Seed 1234 over four rows starts from rows 2 and 0.
        engine.kmeans_train(km, 4, &data).unwrap();
        engine.kmeans_centroids(km, &mut centroids).unwrap();
        assert_eq!(centroids, [10.0, 10.5, 0.0, 0.5]);

        let mut labels = [0i64; 2];
        engine
            .kmeans_assign(km, 2, &[1.0, 0.0, 9.0, 9.0], &mut labels)
            .unwrap();
        assert_eq!(labels, [1, 0]);

        let info = engine.describe(NativeClass::Clustering, km).unwrap();
        assert!(info.is_trained);
        assert_eq!(info.nlist, Some(2));

        assert_eq!(engine.free(NativeClass::Index, km), Err(FAIL));
        engine.free(NativeClass::Clustering, km).unwrap();
        assert_eq!(engine.live_objects(), 0);
    }
}
