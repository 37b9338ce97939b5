//! # vecgate
//!
//! **Leak-free, ownership-tracked handles over a native vector-similarity
//! engine.**
//!
//! vecgate wraps every native index, binary index, and vector transform in
//! a managed handle:
//!
//! - **Explicit release** - `release()` frees native memory deterministically,
//!   is idempotent, and is backed by a drop-time safety net
//! - **Ownership tracking** - composites record which children they own or
//!   borrow, so a handle tree is freed exactly once in any release order
//! - **Validated calls** - buffer shapes are checked before anything crosses
//!   into native code, and native status codes become typed errors
//! - **Batching** - very large searches and adds are split into sub-batches,
//!   and mid-sized work can run on pinned single-thread workers
//!
//! ## Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **Concrete indexes** | Flat, HNSW, PQ, scalar quantizer, LSH |
//! | **Composites** | IVF (flat/PQ/SQ), id map, refine, pre-transform, shards |
//! | **Generic indexes** | Built from descriptions such as `"PCA64,IVF1024,PQ16"` |
//! | **Range search** | Variable-length results copied into managed memory |
//! | **Persistence** | Files and in-memory byte buffers |
//! | **Async API** | Tokio-compatible async operations (feature flag) |
//!
//! ## Quick Start
//!
//! ```rust
//! use vecgate::prelude::*;
//!
//! let runtime = Runtime::mock().unwrap();
//! let mut index = Index::flat(&runtime, 4, MetricType::L2).unwrap();
//!
//! index.add(&[
//!     1.0, 0.0, 0.0, 0.0,
//!     0.0, 1.0, 0.0, 0.0,
//! ]).unwrap();
//!
//! let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
//! assert_eq!(results.labels(), &[0, 1]);
//! index.release().unwrap();
//! ```
//!
//! ### Composites
//!
//! ```rust
//! use vecgate::prelude::*;
//!
//! let runtime = Runtime::mock().unwrap();
//! let quantizer = Index::flat(&runtime, 8, MetricType::L2).unwrap();
//! let ivf = Index::ivf_flat(&quantizer, 4, MetricType::L2, Adoption::Owned).unwrap();
//!
//! // The IVF index owns its quantizer; release the tree through the root.
//! assert!(quantizer.release().is_err());
//! ivf.release().unwrap();
//! assert!(quantizer.is_released());
//! ```
//!
//! ## Crate Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `async` | Enables `AsyncIndex` for tokio compatibility |
//! | `faiss` | Links `libfaiss_c` and uses it as the default engine |
//!
//! ```toml
//! [dependencies]
//! vecgate = { version = "0.1", features = ["async"] }
//! ```
//!
//! ## Architecture
//!
//! - **`vecgate-core`** - Handles, ownership coordinator, native call gateway
//! - **`vecgate`** - Main crate that re-exports everything
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`](crate::Result), which uses
//! the [`Error`] enum. Native failures carry the raw status code and the
//! name of the native function that produced it.
//!
//! ## Thread Safety
//!
//! - [`Index`] is `Send + Sync`; each call holds its handle's lock for the
//!   duration of the native call
//! - [`SharedIndex`] is `Clone` and serializes whole operations
//! - `AsyncIndex` is `Clone` and runs operations on the blocking pool

// Re-export everything from core
pub use vecgate_core::*;
