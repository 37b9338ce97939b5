//! Managed-side helpers for preparing vectors and scoring search quality.
//!
//! Nothing here touches native memory except [`knn`], which builds a
//! temporary flat index.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::metric::MetricType;
use crate::result::{SearchResults, MISSING_LABEL};
use crate::runtime::Runtime;
use crate::vectors::VectorBatch;

/// Rows at or below this norm are left as they are.
const ZERO_NORM: f32 = 1e-10;

/// Scales every `d`-dimensional row of `vectors` to unit L2 norm, in place.
///
/// Zero rows are left unchanged. Normalized vectors make inner-product
/// search rank by cosine similarity.
///
/// # Example
///
/// ```
/// use vecgate_core::preprocessing::normalize_l2;
///
/// let mut v = vec![3.0, 4.0, 0.0, 0.0];
/// normalize_l2(&mut v, 2).unwrap();
/// assert_eq!(v, vec![0.6, 0.8, 0.0, 0.0]);
/// ```
pub fn normalize_l2(vectors: &mut [f32], d: usize) -> Result<()> {
    VectorBatch::new(vectors, d)?;
    for row in vectors.chunks_exact_mut(d) {
        let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= ZERO_NORM {
            continue;
        }
        for x in row.iter_mut() {
            *x /= norm;
        }
    }
    Ok(())
}

/// Normalized copy of `vectors`; see [`normalize_l2`].
pub fn normalized_l2(vectors: &[f32], d: usize) -> Result<Vec<f32>> {
    let mut out = vectors.to_vec();
    normalize_l2(&mut out, d)?;
    Ok(out)
}

/// Row-major `nx * ny` matrix of scores between every row of `x` and every
/// row of `y`, in the engine's convention (squared L2, or raw dot product).
pub fn pairwise_distances(x: &[f32], y: &[f32], d: usize, metric: MetricType) -> Result<Vec<f32>> {
    let xs = VectorBatch::new(x, d)?;
    let ys = VectorBatch::new(y, d)?;
    let ny = ys.len();
    let mut out = vec![0.0; xs.len() * ny];
    if ny == 0 {
        return Ok(out);
    }
    out.par_chunks_mut(ny)
        .zip(x.par_chunks_exact(d))
        .for_each(|(row, a)| {
            for (slot, b) in row.iter_mut().zip(ys.iter()) {
                *slot = metric.score(a, b);
            }
        });
    Ok(out)
}

/// Exact k-nearest-neighbor search without keeping an index around.
///
/// Builds a flat index over `vectors`, searches it, and releases it.
pub fn knn(
    runtime: &Runtime,
    vectors: &[f32],
    queries: &[f32],
    d: usize,
    k: usize,
    metric: MetricType,
) -> Result<SearchResults> {
    let mut index = Index::flat(runtime, d, metric)?;
    index.add(vectors)?;
    let results = index.search(queries, k)?;
    index.release()?;
    Ok(results)
}

/// Fraction of the true top-`k` neighbors found in the top `k` of
/// `results`, averaged over all queries.
///
/// `k` is clamped to the row width of both result sets. Missing neighbors
/// (label `-1`) never count as hits.
///
/// # Errors
///
/// - [`Error::InvalidK`] for `k == 0`
/// - [`Error::InvalidParameter`] if the query counts differ
pub fn recall_at_k(ground_truth: &SearchResults, results: &SearchResults, k: usize) -> Result<f64> {
    if k == 0 {
        return Err(Error::InvalidK(k));
    }
    if ground_truth.num_queries() != results.num_queries() {
        return Err(Error::InvalidParameter(format!(
            "ground truth has {} queries, results have {}",
            ground_truth.num_queries(),
            results.num_queries()
        )));
    }
    let nq = results.num_queries();
    let k = k.min(ground_truth.k()).min(results.k());
    if nq == 0 || k == 0 {
        return Ok(0.0);
    }

    let (gk, rk) = (ground_truth.k(), results.k());
    let mut hits = 0usize;
    for i in 0..nq {
        let truth = &ground_truth.labels()[i * gk..i * gk + k];
        let found = &results.labels()[i * rk..i * rk + k];
        hits += found
            .iter()
            .filter(|&&label| label != MISSING_LABEL && truth.contains(&label))
            .count();
    }
    Ok(hits as f64 / (nq * k) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::MockEngine;
    use std::sync::Arc;

    #[test]
    fn test_normalize_leaves_zero_rows() {
        let mut v = vec![0.0, 0.0, 0.0, 2.0];
        normalize_l2(&mut v, 2).unwrap();
        assert_eq!(v, vec![0.0, 0.0, 0.0, 1.0]);

        let mut ragged = vec![1.0, 2.0, 3.0];
        assert!(matches!(
            normalize_l2(&mut ragged, 2),
            Err(Error::InvalidVectorLength { len: 3, dimension: 2 })
        ));
    }

    #[test]
    fn test_normalized_copy() {
        let v = vec![0.0, 5.0];
        let n = normalized_l2(&v, 2).unwrap();
        assert_eq!(n, vec![0.0, 1.0]);
        assert_eq!(v, vec![0.0, 5.0]);
    }

    #[test]
    fn test_pairwise() {
        let x = [0.0, 0.0, 1.0, 1.0];
        let y = [1.0, 0.0];
        let l2 = pairwise_distances(&x, &y, 2, MetricType::L2).unwrap();
        assert_eq!(l2, vec![1.0, 1.0]);
        let ip = pairwise_distances(&x, &y, 2, MetricType::InnerProduct).unwrap();
        assert_eq!(ip, vec![0.0, 1.0]);
    }

    #[test]
    fn test_knn_releases_temporary_index() {
        let engine = Arc::new(MockEngine::new());
        let runtime = Runtime::new(engine.clone(), EngineConfig::default()).unwrap();
        let results = knn(
            &runtime,
            &[0.0, 0.0, 10.0, 10.0],
            &[9.0, 9.0],
            2,
            1,
            MetricType::L2,
        )
        .unwrap();
        assert_eq!(results.labels(), &[1]);
        assert_eq!(engine.live_objects(), 0);
    }

    #[test]
    fn test_recall() {
        let truth = SearchResults::new(2, 2, vec![0.0; 4], vec![1, 2, 3, 4]);
        let perfect = SearchResults::new(2, 2, vec![0.0; 4], vec![2, 1, 4, 3]);
        assert_eq!(recall_at_k(&truth, &perfect, 2).unwrap(), 1.0);

        let half = SearchResults::new(2, 2, vec![0.0; 4], vec![1, -1, 9, 4]);
        assert_eq!(recall_at_k(&truth, &half, 2).unwrap(), 0.5);
        assert_eq!(recall_at_k(&truth, &half, 1).unwrap(), 0.5);

        let other = SearchResults::new(1, 2, vec![0.0; 2], vec![1, 2]);
        assert!(recall_at_k(&truth, &other, 2).is_err());
        assert!(matches!(recall_at_k(&truth, &perfect, 0), Err(Error::InvalidK(0))));
    }
}
