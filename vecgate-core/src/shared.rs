//! Sharing one index across threads and tasks.
//!
//! [`SharedIndex`] serializes every operation on the wrapped index behind a
//! single lock. With the `async` feature, [`AsyncIndex`] runs each
//! operation on Tokio's blocking pool so native calls never stall an async
//! worker.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;
use crate::handle::{HandleId, IndexKind};
use crate::index::Index;
use crate::range::RangeSearchResult;
use crate::result::SearchResults;

/// An index behind one exclusive lock, cheap to clone across threads.
///
/// # Example
///
/// ```
/// use vecgate_core::{Index, MetricType, Runtime, SharedIndex};
///
/// let runtime = Runtime::mock().unwrap();
/// let shared = SharedIndex::new(Index::flat(&runtime, 2, MetricType::L2).unwrap());
///
/// let writer = shared.clone();
/// std::thread::spawn(move || writer.add(&[1.0, 1.0]).unwrap())
///     .join()
///     .unwrap();
/// assert_eq!(shared.len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct SharedIndex {
    inner: Arc<Mutex<Index>>,
}

impl SharedIndex {
    pub fn new(index: Index) -> Self {
        Self {
            inner: Arc::new(Mutex::new(index)),
        }
    }

    /// Locks the index for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, Index> {
        self.inner.lock()
    }

    pub fn id(&self) -> HandleId {
        self.inner.lock().id()
    }

    pub fn kind(&self) -> IndexKind {
        self.inner.lock().kind()
    }

    pub fn dimension(&self) -> usize {
        self.inner.lock().dimension()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn train(&self, vectors: &[f32]) -> Result<()> {
        self.inner.lock().train(vectors)
    }

    pub fn add(&self, vectors: &[f32]) -> Result<()> {
        self.inner.lock().add(vectors)
    }

    pub fn add_with_ids(&self, vectors: &[f32], ids: &[i64]) -> Result<()> {
        self.inner.lock().add_with_ids(vectors, ids)
    }

    pub fn search(&self, queries: &[f32], k: usize) -> Result<SearchResults> {
        self.inner.lock().search(queries, k)
    }

    pub fn range_search(&self, queries: &[f32], radius: f32) -> Result<RangeSearchResult> {
        self.inner.lock().range_search(queries, radius)
    }

    pub fn reset(&self) -> Result<()> {
        self.inner.lock().reset()
    }

    pub fn release(&self) -> Result<()> {
        self.inner.lock().release()
    }

    /// Takes the index back if this is the last clone.
    pub fn try_unwrap(self) -> std::result::Result<Index, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

impl From<Index> for SharedIndex {
    fn from(index: Index) -> Self {
        Self::new(index)
    }
}

#[cfg(feature = "async")]
mod async_api {
    use super::*;
    use crate::error::Error;

    fn task_failed(e: tokio::task::JoinError) -> Error {
        Error::TaskFailed(format!("spawn_blocking failed: {}", e))
    }

    /// Async wrapper for a shared index.
    ///
    /// Every operation copies its input buffer and runs on
    /// `tokio::task::spawn_blocking`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use vecgate_core::{AsyncIndex, Index, MetricType, Runtime};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let runtime = Runtime::mock().unwrap();
    ///     let index = AsyncIndex::from_sync(Index::flat(&runtime, 2, MetricType::L2).unwrap());
    ///     index.add(vec![0.0, 1.0]).await.unwrap();
    ///     let results = index.search(vec![0.0, 1.0], 1).await.unwrap();
    /// }
    /// ```
    #[derive(Clone, Debug)]
    pub struct AsyncIndex {
        inner: SharedIndex,
    }

    impl AsyncIndex {
        /// Wraps an index in an async wrapper.
        pub fn from_sync(index: Index) -> Self {
            Self {
                inner: SharedIndex::new(index),
            }
        }

        pub fn from_shared(inner: SharedIndex) -> Self {
            Self { inner }
        }

        /// Trains the index asynchronously.
        pub async fn train(&self, vectors: Vec<f32>) -> Result<()> {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.train(&vectors))
                .await
                .map_err(task_failed)?
        }

        /// Adds vectors asynchronously.
        pub async fn add(&self, vectors: Vec<f32>) -> Result<()> {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.add(&vectors))
                .await
                .map_err(task_failed)?
        }

        /// Adds vectors under caller-chosen ids asynchronously.
        pub async fn add_with_ids(&self, vectors: Vec<f32>, ids: Vec<i64>) -> Result<()> {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.add_with_ids(&vectors, &ids))
                .await
                .map_err(task_failed)?
        }

        /// Searches asynchronously.
        pub async fn search(&self, queries: Vec<f32>, k: usize) -> Result<SearchResults> {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.search(&queries, k))
                .await
                .map_err(task_failed)?
        }

        /// Range-searches asynchronously.
        pub async fn range_search(&self, queries: Vec<f32>, radius: f32) -> Result<RangeSearchResult> {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.range_search(&queries, radius))
                .await
                .map_err(task_failed)?
        }

        /// Releases the native index asynchronously.
        pub async fn release(&self) -> Result<()> {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.release())
                .await
                .map_err(task_failed)?
        }

        pub fn len(&self) -> usize {
            self.inner.len()
        }

        pub fn is_empty(&self) -> bool {
            self.inner.is_empty()
        }

        /// Returns the shared sync index.
        pub fn inner(&self) -> &SharedIndex {
            &self.inner
        }
    }
}

#[cfg(feature = "async")]
pub use async_api::AsyncIndex;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::MockEngine;
    use crate::metric::MetricType;
    use crate::runtime::Runtime;
    use std::thread;

    fn shared() -> (Arc<MockEngine>, SharedIndex) {
        let engine = Arc::new(MockEngine::new());
        let runtime = Runtime::new(engine.clone(), EngineConfig::default()).unwrap();
        let index = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        (engine, SharedIndex::new(index))
    }

    #[test]
    fn test_concurrent_adds_are_serialized() {
        let (engine, index) = shared();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let index = index.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        let v = [t as f32, i as f32, 0.0, 1.0];
                        index.add(&v).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(index.len(), 200);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_release_during_searches() {
        let (engine, index) = shared();
        index.add(&[0.0; 40]).unwrap();

        let searchers: Vec<_> = (0..4)
            .map(|_| {
                let index = index.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        // Either a full result or a released handle, never a torn read.
                        match index.search(&[0.0; 4], 3) {
                            Ok(r) => assert_eq!(r.labels().len(), 3),
                            Err(e) => assert!(matches!(e, crate::Error::ReleasedHandle)),
                        }
                    }
                })
            })
            .collect();
        index.release().unwrap();
        for s in searchers {
            s.join().unwrap();
        }
        assert_eq!(engine.calls("free"), 1);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_try_unwrap() {
        let (_engine, index) = shared();
        let other = index.clone();
        let index = index.try_unwrap().unwrap_err();
        drop(other);
        let inner = index.try_unwrap().unwrap();
        assert_eq!(inner.dimension(), 4);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_async_roundtrip() {
        let engine = Arc::new(MockEngine::new());
        let runtime = Runtime::new(engine.clone(), EngineConfig::default()).unwrap();
        let index = AsyncIndex::from_sync(Index::flat(&runtime, 2, MetricType::L2).unwrap());
        index.add(vec![0.0, 0.0, 1.0, 1.0]).await.unwrap();
        assert_eq!(index.len(), 2);

        let results = index.search(vec![1.0, 1.0], 1).await.unwrap();
        assert_eq!(results.labels(), &[1]);

        index.release().await.unwrap();
        assert!(matches!(
            index.search(vec![1.0, 1.0], 1).await,
            Err(crate::Error::ReleasedHandle)
        ));
        assert_eq!(engine.live_objects(), 0);
    }
}
