//! Saving and loading indexes.
//!
//! A loaded index is one native tree, like a generic index: the engine owns
//! every sub-object it rebuilt, and the handle wraps only the root. Its kind
//! is recovered from the runtime type name the engine reports.

use std::path::Path;

use tracing::{debug, info};

use crate::engine::{NativeClass, NativeRef};
use crate::error::{Error, Result};
use crate::handle::IndexKind;
use crate::index::Index;
use crate::runtime::Runtime;

impl Index {
    fn require_persistable(&self, operation: &'static str) -> Result<()> {
        if self.kind() == IndexKind::Binary {
            return Err(Error::UnsupportedOperation {
                operation,
                kind: self.kind(),
            });
        }
        Ok(())
    }

    /// Writes the index to `path` in the engine's format.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use vecgate_core::{Index, MetricType, Runtime};
    ///
    /// let runtime = Runtime::mock().unwrap();
    /// let mut index = Index::flat(&runtime, 2, MetricType::L2).unwrap();
    /// index.add(&[1.0, 2.0]).unwrap();
    /// index.write("vectors.index").unwrap();
    ///
    /// let loaded = Index::read(&runtime, "vectors.index").unwrap();
    /// assert_eq!(loaded.len(), 1);
    /// ```
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let state = self.handle().live()?;
        self.require_persistable("write")?;
        let native = state.native_ref;
        self.runtime()
            .gateway()
            .call("write_index", |e| e.write_index(native, path))?;
        info!(handle = %self.id(), path = %path.display(), "index written");
        Ok(())
    }

    /// Reads an index written by [`Index::write`].
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] when `path` does not exist, before any native call
    /// - [`Error::NativeFailure`] when the engine rejects the contents
    pub fn read(runtime: &Runtime, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Io(format!("{} does not exist", path.display())));
        }
        let native = runtime
            .gateway()
            .call("read_index", |e| e.read_index(path))?;
        let index = Self::adopt_loaded(runtime, native)?;
        info!(handle = %index.id(), path = %path.display(), kind = ?index.kind(), "index read");
        Ok(index)
    }

    /// Serializes the index into an in-memory buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let state = self.handle().live()?;
        self.require_persistable("to_bytes")?;
        let native = state.native_ref;
        self.runtime()
            .gateway()
            .call("serialize_index", |e| e.serialize_index(native))
    }

    /// Rebuilds an index from [`Index::to_bytes`] output.
    pub fn from_bytes(runtime: &Runtime, bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidParameter(
                "serialized index is empty".to_string(),
            ));
        }
        let native = runtime
            .gateway()
            .call("deserialize_index", |e| e.deserialize_index(bytes))?;
        Self::adopt_loaded(runtime, native)
    }

    fn adopt_loaded(runtime: &Runtime, native: NativeRef) -> Result<Self> {
        let gateway = runtime.gateway();
        let info = match gateway.describe(NativeClass::Index, native) {
            Ok(info) => info,
            Err(e) => {
                let _ = gateway.free(NativeClass::Index, native);
                return Err(e);
            }
        };
        let kind = IndexKind::from_type_name(&info.type_name);
        debug!(type_name = %info.type_name, ?kind, "loaded native tree");
        Ok(Index::from_described(runtime, kind, native, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::MockEngine;
    use crate::index::MIN_POINTS_PER_CENTROID;
    use crate::metric::MetricType;
    use crate::ownership::Adoption;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_index_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join("vecgate_test_persist");
        let _ = std::fs::create_dir_all(&dir);
        dir.join(format!("index_{}_{}.bin", std::process::id(), id))
    }

    fn setup() -> (Arc<MockEngine>, Runtime) {
        let engine = Arc::new(MockEngine::new());
        let runtime = Runtime::new(engine.clone(), EngineConfig::default()).unwrap();
        (engine, runtime)
    }

    #[test]
    fn test_write_read_flat() {
        let (_engine, runtime) = setup();
        let path = temp_index_path();
        let mut index = Index::flat(&runtime, 2, MetricType::L2).unwrap();
        index.add(&[0.0, 0.0, 3.0, 4.0]).unwrap();
        index.write(&path).unwrap();

        let loaded = Index::read(&runtime, &path).unwrap();
        assert_eq!(loaded.kind(), IndexKind::Flat);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dimension(), 2);
        assert_ne!(loaded.id(), index.id());

        let results = loaded.search(&[3.0, 4.0], 1).unwrap();
        assert_eq!(results.labels(), &[1]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let (engine, runtime) = setup();
        let path = temp_index_path();
        assert!(matches!(Index::read(&runtime, &path), Err(Error::Io(_))));
        assert_eq!(engine.total_calls(), 0);
    }

    #[test]
    fn test_loaded_composite_owns_its_tree() {
        let (engine, runtime) = setup();
        let quantizer = Index::flat(&runtime, 4, MetricType::L2).unwrap();
        let mut ivf = Index::ivf_flat(&quantizer, 2, MetricType::L2, Adoption::Owned).unwrap();
        let data: Vec<f32> = (0..2 * MIN_POINTS_PER_CENTROID * 4).map(|i| (i % 17) as f32).collect();
        ivf.train(&data).unwrap();
        ivf.add(&data).unwrap();

        let bytes = ivf.to_bytes().unwrap();
        ivf.release().unwrap();
        assert_eq!(engine.live_objects(), 0);

        let loaded = Index::from_bytes(&runtime, &bytes).unwrap();
        assert_eq!(loaded.kind(), IndexKind::InvertedFile);
        assert_eq!(loaded.nlist(), Some(2));
        assert!(loaded.is_trained());
        assert_eq!(loaded.len(), 2 * MIN_POINTS_PER_CENTROID);
        assert!(loaded.owned_children().is_empty());

        loaded.release().unwrap();
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_corrupt_bytes_rejected() {
        let (engine, runtime) = setup();
        let index = Index::flat(&runtime, 2, MetricType::L2).unwrap();
        let mut bytes = index.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Index::from_bytes(&runtime, &bytes),
            Err(Error::NativeFailure {
                function: "deserialize_index",
                ..
            })
        ));
        assert!(matches!(
            Index::from_bytes(&runtime, &[]),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(engine.live_objects(), 1);
    }

    #[test]
    fn test_binary_not_persistable() {
        let (_engine, runtime) = setup();
        let index = Index::binary_flat(&runtime, 8).unwrap();
        assert!(matches!(
            index.to_bytes(),
            Err(Error::UnsupportedOperation {
                operation: "to_bytes",
                kind: IndexKind::Binary
            })
        ));
    }
}
