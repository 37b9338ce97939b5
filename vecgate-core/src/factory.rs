//! Generic indexes built from a textual pipeline description.
//!
//! The engine's own parser builds the whole pipeline as one native tree, so
//! a generic index wraps a single reference and the coordinator tracks no
//! children for it. The managed parse in [`crate::descriptor`] is used only
//! for read-only introspection; a description the engine accepts but the
//! managed parser does not still yields a working index, just without a
//! [`PipelineDescriptor`].

use tracing::debug;

use crate::descriptor::{PipelineDescriptor, Stage};
use crate::error::{Error, Result};
use crate::handle::IndexKind;
use crate::index::concrete::check_dimension;
use crate::index::Index;
use crate::metric::MetricType;
use crate::runtime::Runtime;

pub use crate::descriptor::{recommend, validate, Requirements};

impl Index {
    /// Builds an index from a pipeline description such as
    /// `"PCA64,IVF1024,PQ16"`.
    ///
    /// # Example
    ///
    /// ```
    /// use vecgate_core::{Index, IndexKind, MetricType, Runtime};
    ///
    /// let runtime = Runtime::mock().unwrap();
    /// let index = Index::from_description(&runtime, 64, "IVF16,Flat", MetricType::L2).unwrap();
    /// assert_eq!(index.kind(), IndexKind::Generic);
    /// assert_eq!(index.nlist(), Some(16));
    /// assert!(!index.is_trained());
    /// ```
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDescription`] for empty text, before any native call
    /// - [`Error::InvalidDimension`] for `d == 0`
    /// - [`Error::NativeFailure`] when the engine rejects the description
    pub fn from_description(
        runtime: &Runtime,
        d: usize,
        description: &str,
        metric: MetricType,
    ) -> Result<Self> {
        let text = description.trim();
        if text.is_empty() {
            return Err(Error::InvalidDescription(
                "description is empty".to_string(),
            ));
        }
        check_dimension(d)?;

        let pipeline = match PipelineDescriptor::parse(text) {
            Ok(p) => Some(p),
            Err(e) => {
                debug!(description = text, error = %e, "description left to the engine's parser");
                None
            }
        };
        let native = runtime
            .gateway()
            .call("index_factory", |e| e.index_factory(d, text, metric))?;
        let index = Index::from_native(runtime, IndexKind::Generic, native)?;
        Ok(index.with_pipeline(text.to_string(), pipeline))
    }

    /// The first stage of a generic index's pipeline, read without touching
    /// native memory.
    pub fn first_stage(&self) -> Option<Stage> {
        self.pipeline().map(PipelineDescriptor::first_stage)
    }
}
