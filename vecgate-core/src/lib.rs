//! # vecgate Core
//!
//! Core library for vecgate: safe, ownership-tracked handles over a native
//! vector-similarity engine.
//!
//! Every native object (index, binary index, vector transform, k-means) is wrapped in
//! a handle with an explicit, idempotent release and a drop-time safety net.
//! Composite indexes record which children they own or borrow, so a tree of
//! handles is freed exactly once no matter which order callers release it
//! in. All native calls go through one gateway that validates buffers before
//! crossing, maps raw status codes to [`Error::NativeFailure`], logs with
//! `tracing`, and feeds the [`metrics`] counters.
//!
//! ## Crate Features
//!
//! - `async` - Enables [`AsyncIndex`] for tokio-compatible async operations
//! - `faiss` - Links the FAISS C API and makes it the [`engine::default_engine`]
//!
//! ## Core Types
//!
//! ### Handles
//!
//! - [`Index`] - A managed native index of any [`IndexKind`]
//! - [`VectorTransform`] - PCA, OPQ, and random rotations
//! - [`Kmeans`] - Standalone k-means clustering
//! - [`Adoption`] - Whether a composite owns or borrows a child
//!
//! ### Engine
//!
//! - [`Runtime`] - An engine plus its [`EngineConfig`], passed to constructors
//! - [`NativeEngine`] - The native function table
//! - [`MockEngine`] - In-process engine used by tests, benches, and demos
//!
//! ### Results
//!
//! - [`SearchResults`] - Top-k neighbors, row-major
//! - [`RangeSearchResult`] - Variable-length hits per query
//!
//! ## Example
//!
//! ```rust
//! use vecgate_core::prelude::*;
//!
//! let runtime = Runtime::mock().unwrap();
//! let mut index = Index::flat(&runtime, 2, MetricType::L2).unwrap();
//! index.add(&[0.0, 0.0, 1.0, 0.0]).unwrap();
//!
//! let results = index.search(&[1.0, 0.0], 1).unwrap();
//! assert_eq!(results.labels(), &[1]);
//! index.release().unwrap();
//! ```

pub mod batch;
pub mod clustering;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod factory;
mod gateway;
pub mod handle;
pub mod index;
pub mod metric;
pub mod metrics;
pub mod ownership;
pub mod persistence;
pub mod preprocessing;
pub mod range;
pub mod result;
pub mod runtime;
pub mod shared;
pub mod transform;
pub mod vectors;

// Re-exports for convenient access
pub use batch::BatchConfig;
pub use clustering::Kmeans;
pub use config::EngineConfig;
pub use descriptor::PipelineDescriptor;
pub use engine::{MockEngine, NativeEngine, QuantizerType};
pub use error::{Error, Result};
pub use handle::{HandleId, IndexKind};
pub use index::Index;
pub use metric::MetricType;
pub use ownership::Adoption;
pub use range::RangeSearchResult;
pub use result::{BinarySearchResults, Neighbor, SearchResults};
pub use runtime::Runtime;
pub use shared::SharedIndex;
#[cfg(feature = "async")]
pub use shared::AsyncIndex;
pub use transform::{TransformKind, VectorTransform};
pub use vectors::{CodeBatch, VectorBatch};

/// Re-export commonly used types for convenience.
///
/// # Example
///
/// ```rust
/// use vecgate_core::prelude::*;
///
/// let runtime = Runtime::mock().unwrap();
/// let quantizer = Index::flat(&runtime, 8, MetricType::L2).unwrap();
/// let ivf = Index::ivf_flat(&quantizer, 4, MetricType::L2, Adoption::Owned).unwrap();
/// assert_eq!(quantizer.owner(), Some(ivf.id()));
/// ```
pub mod prelude {
    pub use crate::{
        Adoption, BatchConfig, EngineConfig, Error, Index, IndexKind, Kmeans, MetricType,
        QuantizerType, RangeSearchResult, Result, Runtime, SearchResults, SharedIndex,
        VectorTransform,
    };
}
