//! k-nearest-neighbor search results.

use serde::{Deserialize, Serialize};

/// Label the engine writes into slots it could not fill.
pub const MISSING_LABEL: i64 = -1;

/// One neighbor of a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor<D = f32> {
    pub label: i64,
    pub distance: D,
}

/// Row-major `nq x k` distances and labels.
///
/// When fewer than `k` neighbors exist, the trailing slots of a row hold
/// [`MISSING_LABEL`] and the metric's sentinel distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults<D = f32> {
    nq: usize,
    k: usize,
    distances: Vec<D>,
    labels: Vec<i64>,
}

/// Results of a binary-code search; distances are Hamming distances.
pub type BinarySearchResults = SearchResults<i32>;

impl<D: Copy> SearchResults<D> {
    pub(crate) fn new(nq: usize, k: usize, distances: Vec<D>, labels: Vec<i64>) -> Self {
        debug_assert_eq!(distances.len(), nq * k);
        debug_assert_eq!(labels.len(), nq * k);
        Self {
            nq,
            k,
            distances,
            labels,
        }
    }

    pub(crate) fn empty(k: usize) -> Self {
        Self::new(0, k, Vec::new(), Vec::new())
    }

    pub fn num_queries(&self) -> usize {
        self.nq
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn is_empty(&self) -> bool {
        self.nq == 0
    }

    /// All distances, row-major.
    pub fn distances(&self) -> &[D] {
        &self.distances
    }

    /// All labels, row-major.
    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    /// The `k` slots of query `i`, including missing ones.
    pub fn row(&self, i: usize) -> Option<(&[D], &[i64])> {
        if i >= self.nq {
            return None;
        }
        let range = i * self.k..(i + 1) * self.k;
        Some((&self.distances[range.clone()], &self.labels[range]))
    }

    /// The found neighbors of query `i`, best first.
    pub fn neighbors(&self, i: usize) -> Vec<Neighbor<D>> {
        self.row(i)
            .map(|(distances, labels)| {
                labels
                    .iter()
                    .zip(distances)
                    .filter(|(label, _)| **label != MISSING_LABEL)
                    .map(|(&label, &distance)| Neighbor { label, distance })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn into_parts(self) -> (Vec<D>, Vec<i64>) {
        (self.distances, self.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_and_missing_neighbors() {
        let results = SearchResults::new(
            2,
            2,
            vec![0.5, f32::INFINITY, 1.0, 2.0],
            vec![3, MISSING_LABEL, 0, 1],
        );
        assert_eq!(results.num_queries(), 2);
        assert_eq!(results.row(1), Some((&[1.0, 2.0][..], &[0, 1][..])));
        assert!(results.row(2).is_none());

        let first = results.neighbors(0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0], Neighbor { label: 3, distance: 0.5 });
        assert!(results.neighbors(5).is_empty());
    }

    #[test]
    fn test_empty() {
        let results: BinarySearchResults = SearchResults::empty(4);
        assert!(results.is_empty());
        assert_eq!(results.k(), 4);
        let (d, l) = results.into_parts();
        assert!(d.is_empty() && l.is_empty());
    }
}
