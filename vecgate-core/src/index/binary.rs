//! Indexes over packed binary codes.
//!
//! A binary index of dimension `d` stores `d / 8`-byte codes and ranks them
//! by Hamming distance. Float operations on a binary index, and code
//! operations on a float index, fail with
//! [`Error::UnsupportedOperation`].

use crate::engine::NativeClass;
use crate::error::{Error, Result};
use crate::handle::IndexKind;
use crate::ownership::{self, Adoption};
use crate::result::{BinarySearchResults, SearchResults};
use crate::runtime::Runtime;
use crate::vectors::CodeBatch;

use super::Index;

fn check_bits(d: usize) -> Result<()> {
    if d == 0 || d % 8 != 0 {
        return Err(Error::InvalidDimension(format!(
            "binary dimension must be a positive multiple of 8, got {}",
            d
        )));
    }
    Ok(())
}

impl Index {
    /// Exhaustive Hamming search over `d`-bit codes.
    pub fn binary_flat(runtime: &Runtime, d: usize) -> Result<Self> {
        check_bits(d)?;
        let native = runtime
            .gateway()
            .call("binary_flat_new", |e| e.binary_flat_new(d))?;
        Index::from_native(runtime, IndexKind::Binary, native)
    }

    /// Inverted lists of binary codes over a binary `quantizer`.
    pub fn binary_ivf(quantizer: &Index, nlist: usize, adoption: Adoption) -> Result<Self> {
        if quantizer.kind() != IndexKind::Binary {
            return Err(Error::InvalidParameter(
                "the quantizer of a binary IVF must be a binary index".to_string(),
            ));
        }
        if nlist == 0 {
            return Err(Error::InvalidParameter("nlist must be positive".to_string()));
        }
        let d = quantizer.dimension();
        let runtime = quantizer.runtime();
        let gateway = runtime.gateway();
        let handle = ownership::compose(
            gateway,
            NativeClass::BinaryIndex,
            &[(quantizer.handle(), adoption)],
            |refs| gateway.call("binary_ivf_new", |e| e.binary_ivf_new(refs[0], d, nlist)),
        )?;
        Ok(
            Index::from_handle(runtime, handle, IndexKind::Binary, d, quantizer.metric())
                .with_nlist(Some(nlist)),
        )
    }

    /// Multi-bit hashing of `d`-bit codes on their first `nbits` bits.
    pub fn binary_hash(runtime: &Runtime, d: usize, nbits: usize) -> Result<Self> {
        check_bits(d)?;
        if nbits == 0 || nbits > d {
            return Err(Error::InvalidParameter(format!(
                "hash bits must be in 1..={}, got {}",
                d, nbits
            )));
        }
        let native = runtime
            .gateway()
            .call("binary_hash_new", |e| e.binary_hash_new(d, nbits))?;
        Index::from_native(runtime, IndexKind::Binary, native)
    }

    /// Bytes per code of a binary index.
    pub fn code_size(&self) -> usize {
        self.dimension() / 8
    }

    fn require_binary(&self, operation: &'static str) -> Result<()> {
        if self.kind() != IndexKind::Binary {
            return Err(Error::UnsupportedOperation {
                operation,
                kind: self.kind(),
            });
        }
        Ok(())
    }

    /// Trains a binary index on packed codes.
    pub fn train_codes(&mut self, codes: &[u8]) -> Result<()> {
        let mut state = self.handle().live()?;
        self.require_binary("train_codes")?;
        let batch = CodeBatch::new(codes, self.code_size())?;
        if batch.is_empty() || state.is_trained {
            return Ok(());
        }
        self.check_training_size(batch.len())?;
        let index = state.native_ref;
        let gateway = self.runtime().gateway();
        self.runtime()
            .run_batch(batch.len(), || gateway.binary_train(index, batch))?;
        state.is_trained = true;
        Ok(())
    }

    /// Adds packed codes under sequential labels.
    pub fn add_codes(&mut self, codes: &[u8]) -> Result<()> {
        let mut state = self.handle().live()?;
        self.require_binary("add_codes")?;
        let batch = CodeBatch::new(codes, self.code_size())?;
        if batch.is_empty() {
            return Ok(());
        }
        if !state.is_trained {
            return Err(Error::NotTrained);
        }
        let index = state.native_ref;
        let count = &mut state.element_count;
        let chunk = self.runtime().config().batch.add_batch_size;
        let gateway = self.runtime().gateway();
        self.runtime().run_batch(batch.len(), || {
            for sub in batch.chunks(chunk) {
                gateway.binary_add(index, sub)?;
                *count += sub.len();
            }
            Ok(())
        })
    }

    /// Finds the `k` codes nearest in Hamming distance to each query code.
    pub fn search_codes(&self, codes: &[u8], k: usize) -> Result<BinarySearchResults> {
        let state = self.handle().live()?;
        self.require_binary("search_codes")?;
        if k == 0 {
            return Err(Error::InvalidK(k));
        }
        let batch = CodeBatch::new(codes, self.code_size())?;
        if batch.is_empty() {
            return Ok(SearchResults::empty(k));
        }
        if !state.is_trained {
            return Err(Error::NotTrained);
        }
        let nq = batch.len();
        let mut distances = vec![0i32; nq * k];
        let mut labels = vec![-1i64; nq * k];
        let index = state.native_ref;
        let chunk = self.runtime().config().batch.search_batch_size;
        let gateway = self.runtime().gateway();
        self.runtime().run_batch(nq, || {
            let windows = distances
                .chunks_mut(chunk * k)
                .zip(labels.chunks_mut(chunk * k));
            for (sub, (d, l)) in batch.chunks(chunk).zip(windows) {
                gateway.binary_search(index, sub, k, d, l)?;
            }
            Ok::<_, Error>(())
        })?;
        Ok(SearchResults::new(nq, k, distances, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::config::EngineConfig;
    use crate::engine::MockEngine;
    use crate::index::MIN_POINTS_PER_CENTROID;
    use crate::metric::MetricType;
    use std::sync::Arc;

    fn runtime_with(batch: BatchConfig) -> (Arc<MockEngine>, Runtime) {
        let engine = Arc::new(MockEngine::new());
        let runtime =
            Runtime::new(engine.clone(), EngineConfig::new().with_batch(batch)).unwrap();
        (engine, runtime)
    }

    fn setup() -> (Arc<MockEngine>, Runtime) {
        runtime_with(BatchConfig::default())
    }

    #[test]
    fn test_hamming_search() {
        let (_engine, runtime) = setup();
        let mut index = Index::binary_flat(&runtime, 16).unwrap();
        assert_eq!(index.code_size(), 2);
        index
            .add_codes(&[0b0000_0000, 0, 0b1111_0000, 0, 0xFF, 0xFF])
            .unwrap();
        assert_eq!(index.len(), 3);

        let results = index.search_codes(&[0b1110_0000, 0], 2).unwrap();
        assert_eq!(results.labels(), &[1, 0]);
        assert_eq!(results.distances(), &[1, 3]);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let (engine, runtime) = setup();
        let mut binary = Index::binary_flat(&runtime, 8).unwrap();
        let mut float = Index::flat(&runtime, 8, MetricType::L2).unwrap();
        engine.reset_calls();

        assert!(matches!(
            binary.add(&[0.0; 8]),
            Err(Error::UnsupportedOperation {
                operation: "add",
                kind: IndexKind::Binary
            })
        ));
        assert!(matches!(
            binary.search(&[0.0; 8], 1),
            Err(Error::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            float.add_codes(&[0]),
            Err(Error::UnsupportedOperation {
                operation: "add_codes",
                kind: IndexKind::Flat
            })
        ));
        assert!(binary.reconstruct(0).is_err());
        assert_eq!(engine.total_calls(), 0);
    }

    #[test]
    fn test_binary_ivf_lifecycle() {
        let (engine, runtime) = setup();
        assert!(Index::binary_flat(&runtime, 12).is_err());

        let quantizer = Index::binary_flat(&runtime, 8).unwrap();
        let mut ivf = Index::binary_ivf(&quantizer, 2, Adoption::Owned).unwrap();
        assert!(!ivf.is_trained());
        assert!(matches!(ivf.add_codes(&[1, 2]), Err(Error::NotTrained)));

        let codes: Vec<u8> = (0..2 * MIN_POINTS_PER_CENTROID).map(|i| i as u8).collect();
        ivf.train_codes(&codes).unwrap();
        ivf.add_codes(&codes).unwrap();
        let results = ivf.search_codes(&[7], 1).unwrap();
        assert_eq!(results.distances(), &[0]);

        ivf.reset().unwrap();
        assert_eq!(ivf.len(), 0);

        ivf.release().unwrap();
        assert!(quantizer.is_released());
        assert_eq!(engine.live_objects(), 0);
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_codes_split_into_sub_batches() {
        let batch = BatchConfig::default()
            .with_add_batch_size(2)
            .with_search_batch_size(2);
        let (engine, runtime) = runtime_with(batch);
        let mut index = Index::binary_flat(&runtime, 8).unwrap();

        index.add_codes(&[0x00, 0x01, 0x03, 0x07, 0x0F]).unwrap();
        assert_eq!(engine.calls("binary_add"), 3);
        assert_eq!(index.len(), 5);

        let results = index.search_codes(&[0x0F, 0x00, 0x03], 1).unwrap();
        assert_eq!(engine.calls("binary_search"), 2);
        assert_eq!(results.labels(), &[4, 0, 2]);
        assert_eq!(results.distances(), &[0, 0, 0]);

        // A failing first sub-batch stops the add with nothing counted.
        engine.fail_next("binary_add", -1);
        assert!(index.add_codes(&[0xFF, 0xFE, 0xFC]).is_err());
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn test_binary_hash() {
        let (_engine, runtime) = setup();
        assert!(Index::binary_hash(&runtime, 8, 9).is_err());
        let mut index = Index::binary_hash(&runtime, 8, 4).unwrap();
        index.add_codes(&[0xF0, 0x0F]).unwrap();
        assert_eq!(index.search_codes(&[0x0F], 1).unwrap().labels(), &[1]);
    }
}
