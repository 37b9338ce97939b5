//! The single crossing point into the native engine.
//!
//! Every native function is invoked through [`Gateway::call`], which turns a
//! raw non-zero status into [`Error::NativeFailure`] carrying the code and the
//! function name. The bulk operations (train, add, search, range search,
//! reset) additionally short-circuit empty inputs without crossing the
//! boundary and record timing when metrics are enabled.
//!
//! The gateway holds no per-handle state. Its only shared state is the engine
//! itself, whose process-wide settings are applied once by
//! [`Runtime::new`](crate::Runtime::new).

use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::engine::{NativeClass, NativeEngine, NativeRef, NativeResult, ObjectInfo, NULL_REF};
use crate::error::{Error, Result};
use crate::metrics::{Operation, Timer};
use crate::vectors::{CodeBatch, VectorBatch};

#[derive(Clone)]
pub(crate) struct Gateway {
    engine: Arc<dyn NativeEngine>,
}

impl Gateway {
    pub(crate) fn new(engine: Arc<dyn NativeEngine>) -> Self {
        Self { engine }
    }

    pub(crate) fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub(crate) fn same_engine(&self, other: &Gateway) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }

    /// Invokes one native function and maps its status.
    pub(crate) fn call<T>(
        &self,
        function: &'static str,
        f: impl FnOnce(&dyn NativeEngine) -> NativeResult<T>,
    ) -> Result<T> {
        trace!(function, "native call");
        f(self.engine.as_ref()).map_err(|code| {
            warn!(function, code, engine = self.engine.name(), "native call failed");
            Error::NativeFailure { code, function }
        })
    }

    pub(crate) fn set_num_threads(&self, threads: usize) -> Result<()> {
        self.call("set_num_threads", |e| e.set_num_threads(threads))
    }

    pub(crate) fn describe(&self, class: NativeClass, object: NativeRef) -> Result<ObjectInfo> {
        self.call("describe", |e| e.describe(class, object))
    }

    pub(crate) fn set_own_fields(&self, object: NativeRef, own: bool) -> Result<()> {
        self.call("set_own_fields", |e| e.set_own_fields(object, own))
    }

    /// Frees a native object. Freeing the null reference is a no-op.
    pub(crate) fn free(&self, class: NativeClass, object: NativeRef) -> Result<()> {
        if object == NULL_REF {
            return Ok(());
        }
        self.call("free", |e| e.free(class, object))
    }

    pub(crate) fn train(&self, index: NativeRef, x: VectorBatch<'_>) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        let timer = Timer::start();
        self.call("train", |e| e.train(index, x.len(), x.as_slice()))?;
        timer.record(Operation::Train, x.len());
        Ok(())
    }

    pub(crate) fn add(&self, index: NativeRef, x: VectorBatch<'_>) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        let timer = Timer::start();
        self.call("add", |e| e.add(index, x.len(), x.as_slice()))?;
        timer.record(Operation::Add, x.len());
        Ok(())
    }

    pub(crate) fn add_with_ids(
        &self,
        index: NativeRef,
        x: VectorBatch<'_>,
        ids: &[i64],
    ) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        let timer = Timer::start();
        self.call("add_with_ids", |e| {
            e.add_with_ids(index, x.len(), x.as_slice(), ids)
        })?;
        timer.record(Operation::Add, x.len());
        Ok(())
    }

    /// Searches `x`, writing `x.len() * k` slots into each output buffer.
    pub(crate) fn search(
        &self,
        index: NativeRef,
        x: VectorBatch<'_>,
        k: usize,
        distances: &mut [f32],
        labels: &mut [i64],
    ) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        debug_assert_eq!(distances.len(), x.len() * k);
        debug_assert_eq!(labels.len(), x.len() * k);
        let timer = Timer::start();
        self.call("search", |e| {
            e.search(index, x.len(), x.as_slice(), k, distances, labels)
        })?;
        let found = labels.iter().filter(|&&l| l >= 0).count();
        timer.record_with_results(Operation::Search, x.len(), found);
        Ok(())
    }

    pub(crate) fn assign(&self, index: NativeRef, x: VectorBatch<'_>) -> Result<Vec<i64>> {
        let mut labels = vec![-1; x.len()];
        if x.is_empty() {
            return Ok(labels);
        }
        self.call("assign", |e| {
            e.assign(index, x.len(), x.as_slice(), &mut labels)
        })?;
        Ok(labels)
    }

    pub(crate) fn reset(&self, class: NativeClass, index: NativeRef) -> Result<()> {
        let timer = Timer::start();
        match class {
            NativeClass::BinaryIndex => self.call("binary_reset", |e| e.binary_reset(index))?,
            _ => self.call("reset", |e| e.reset(index))?,
        }
        timer.record(Operation::Reset, 0);
        Ok(())
    }

    pub(crate) fn binary_train(&self, index: NativeRef, x: CodeBatch<'_>) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        let timer = Timer::start();
        self.call("binary_train", |e| e.binary_train(index, x.len(), x.as_slice()))?;
        timer.record(Operation::Train, x.len());
        Ok(())
    }

    pub(crate) fn binary_add(&self, index: NativeRef, x: CodeBatch<'_>) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        let timer = Timer::start();
        self.call("binary_add", |e| e.binary_add(index, x.len(), x.as_slice()))?;
        timer.record(Operation::Add, x.len());
        Ok(())
    }

    pub(crate) fn binary_search(
        &self,
        index: NativeRef,
        x: CodeBatch<'_>,
        k: usize,
        distances: &mut [i32],
        labels: &mut [i64],
    ) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        let timer = Timer::start();
        self.call("binary_search", |e| {
            e.binary_search(index, x.len(), x.as_slice(), k, distances, labels)
        })?;
        let found = labels.iter().filter(|&&l| l >= 0).count();
        timer.record_with_results(Operation::Search, x.len(), found);
        Ok(())
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("engine", &self.engine.name())
            .finish()
    }
}
