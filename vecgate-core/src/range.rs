//! Range search results.
//!
//! The engine returns range search hits in a container it allocates and owns.
//! Results are copied out of it into managed vectors, and the container is
//! freed on every path: after a successful copy, and from a drop guard if
//! the search or the copy fails.

use std::mem;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::{status, NativeRef, NULL_REF};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::metrics::{Operation, Timer};
use crate::vectors::VectorBatch;

/// Variable-length hits for a batch of queries.
///
/// Hits for query `i` are `labels[offsets[i]..offsets[i + 1]]` and the
/// matching `distances` window, best first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RangeSearchResult {
    offsets: Vec<usize>,
    labels: Vec<i64>,
    distances: Vec<f32>,
}

impl RangeSearchResult {
    pub(crate) fn empty() -> Self {
        Self {
            offsets: vec![0],
            labels: Vec::new(),
            distances: Vec::new(),
        }
    }

    pub fn num_queries(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Hits across all queries.
    pub fn total_results(&self) -> usize {
        self.labels.len()
    }

    /// Number of hits for query `i`; zero past the end.
    pub fn num_results(&self, i: usize) -> usize {
        self.get(i).map_or(0, |(labels, _)| labels.len())
    }

    /// Labels and distances for query `i`.
    pub fn get(&self, i: usize) -> Option<(&[i64], &[f32])> {
        let start = *self.offsets.get(i)?;
        let end = *self.offsets.get(i + 1)?;
        let labels = self.labels.get(start..end)?;
        let distances = self.distances.get(start..end)?;
        Some((labels, distances))
    }

    /// Appends the hits of a later sub-batch of queries, shifting its
    /// offsets past the hits already held.
    pub(crate) fn append(&mut self, other: RangeSearchResult) {
        if self.offsets.is_empty() {
            self.offsets.push(0);
        }
        let base = self.labels.len();
        self.offsets
            .extend(other.offsets.iter().skip(1).map(|offset| offset + base));
        self.labels.extend(other.labels);
        self.distances.extend(other.distances);
    }

    /// Iterates over per-query hits in query order.
    pub fn iter(&self) -> impl Iterator<Item = (&[i64], &[f32])> + '_ {
        (0..self.num_queries()).filter_map(move |i| self.get(i))
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    pub fn distances(&self) -> &[f32] {
        &self.distances
    }
}

/// Frees the native container unless it has already been freed.
struct Container<'g> {
    gateway: &'g Gateway,
    native: NativeRef,
}

impl<'g> Container<'g> {
    fn allocate(gateway: &'g Gateway, nq: usize) -> Result<Self> {
        let native = gateway.call("range_result_new", |e| e.range_result_new(nq))?;
        Ok(Self { gateway, native })
    }

    fn free(mut self) -> Result<()> {
        let native = mem::replace(&mut self.native, NULL_REF);
        self.gateway
            .call("range_result_free", |e| e.range_result_free(native))
    }
}

impl Drop for Container<'_> {
    fn drop(&mut self) {
        if self.native == NULL_REF {
            return;
        }
        let native = self.native;
        if let Err(e) = self
            .gateway
            .call("range_result_free", |e| e.range_result_free(native))
        {
            warn!(error = %e, "failed to free range result container");
        }
    }
}

/// Runs a range search and copies the hits into managed memory.
pub(crate) fn range_search(
    gateway: &Gateway,
    index: NativeRef,
    queries: VectorBatch<'_>,
    radius: f32,
) -> Result<RangeSearchResult> {
    let nq = queries.len();
    if nq == 0 {
        return Ok(RangeSearchResult::empty());
    }
    let timer = Timer::start();

    let container = Container::allocate(gateway, nq)?;
    let result = container.native;
    gateway.call("range_search", |e| {
        e.range_search(index, nq, queries.as_slice(), radius, result)
    })?;

    let total = gateway.call("range_result_size", |e| e.range_result_size(result))?;
    let mut offsets = vec![0usize; nq + 1];
    let mut labels = vec![0i64; total];
    let mut distances = vec![0.0f32; total];
    gateway.call("range_result_copy", |e| {
        e.range_result_copy(result, &mut offsets, &mut labels, &mut distances)
    })?;
    container.free()?;

    let consistent = offsets[0] == 0
        && offsets.windows(2).all(|w| w[0] <= w[1])
        && offsets[nq] == total;
    if !consistent {
        warn!(nq, total, "engine returned inconsistent range offsets");
        return Err(Error::NativeFailure {
            code: status::ENGINE_ERROR,
            function: "range_result_copy",
        });
    }

    timer.record_with_results(Operation::RangeSearch, nq, total);
    Ok(RangeSearchResult {
        offsets,
        labels,
        distances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngine, NativeEngine};
    use crate::metric::MetricType;
    use std::sync::Arc;

    fn setup() -> (Arc<MockEngine>, Gateway, NativeRef) {
        let engine = Arc::new(MockEngine::new());
        let gateway = Gateway::new(engine.clone());
        let index = engine.index_flat_new(2, MetricType::L2).unwrap();
        engine
            .add(index, 3, &[0.0, 0.0, 1.0, 0.0, 5.0, 5.0])
            .unwrap();
        (engine, gateway, index)
    }

    #[test]
    fn test_hits_are_grouped_by_query() {
        let (engine, gateway, index) = setup();
        let queries = [0.0, 0.0, 9.0, 9.0];
        let result =
            range_search(&gateway, index, VectorBatch::new(&queries, 2).unwrap(), 1.5).unwrap();

        assert_eq!(result.num_queries(), 2);
        assert_eq!(result.offsets(), &[0, 2, 2]);
        assert_eq!(result.get(0), Some((&[0, 1][..], &[0.0, 1.0][..])));
        assert_eq!(result.num_results(1), 0);
        assert_eq!(result.total_results(), 2);
        assert_eq!(result.iter().count(), 2);
        assert_eq!(engine.calls("range_result_free"), 1);
        assert_eq!(engine.live_objects(), 1);
    }

    #[test]
    fn test_container_freed_when_search_fails() {
        let (engine, gateway, index) = setup();
        engine.fail_next("range_search", -4);
        let err = range_search(&gateway, index, VectorBatch::new(&[0.0, 0.0], 2).unwrap(), 1.0)
            .unwrap_err();
        assert_eq!(err.native_code(), Some(-4));
        assert_eq!(engine.calls("range_result_free"), 1);
        assert_eq!(engine.live_objects(), 1);
    }

    #[test]
    fn test_container_freed_when_copy_fails() {
        let (engine, gateway, index) = setup();
        engine.fail_next("range_result_copy", -9);
        assert!(
            range_search(&gateway, index, VectorBatch::new(&[0.0, 0.0], 2).unwrap(), 1.0)
                .is_err()
        );
        assert_eq!(engine.live_objects(), 1);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_append_shifts_offsets() {
        let (_engine, gateway, index) = setup();
        let first = [0.0, 0.0, 9.0, 9.0];
        let second = [5.0, 5.0];
        let mut merged = RangeSearchResult::empty();
        for queries in [&first[..], &second[..]] {
            let part = range_search(&gateway, index, VectorBatch::new(queries, 2).unwrap(), 1.5)
                .unwrap();
            merged.append(part);
        }
        assert_eq!(merged.num_queries(), 3);
        assert_eq!(merged.offsets(), &[0, 2, 2, 3]);
        assert_eq!(merged.get(2), Some((&[2][..], &[0.0][..])));
    }

    #[test]
    fn test_inconsistent_deserialized_offsets_do_not_panic() {
        let result: RangeSearchResult = serde_json::from_str(
            r#"{"offsets":[0,5,1],"labels":[3],"distances":[0.5]}"#,
        )
        .unwrap();
        assert_eq!(result.num_queries(), 2);
        assert_eq!(result.get(0), None);
        assert_eq!(result.get(1), None);
        assert_eq!(result.num_results(0), 0);
        assert_eq!(result.iter().count(), 0);
    }

    #[test]
    fn test_empty_queries_skip_engine() {
        let (engine, gateway, index) = setup();
        let result = range_search(&gateway, index, VectorBatch::new(&[], 2).unwrap(), 1.0).unwrap();
        assert_eq!(result.num_queries(), 0);
        assert_eq!(engine.calls("range_result_new"), 0);
    }
}
