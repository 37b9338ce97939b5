//! Flat vector buffers passed across the engine boundary.
//!
//! The engine takes `n * d` contiguous floats. [`VectorBatch`] is a borrowed,
//! validated view over such a buffer: once constructed, its length is known
//! to be an exact multiple of the dimension, so the gateway can hand the
//! slice to native code without copying or re-checking.

use crate::error::{Error, Result};

/// A validated, borrowed batch of `len()` vectors of `dimension()` floats.
#[derive(Debug, Clone, Copy)]
pub struct VectorBatch<'a> {
    data: &'a [f32],
    dimension: usize,
}

impl<'a> VectorBatch<'a> {
    /// Wraps a flat buffer.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDimension`] for a zero dimension, and
    /// [`Error::InvalidVectorLength`] when the length is not a multiple of it.
    ///
    /// # Example
    ///
    /// ```
    /// use vecgate_core::VectorBatch;
    ///
    /// let batch = VectorBatch::new(&[1.0, 0.0, 0.0, 1.0], 2).unwrap();
    /// assert_eq!(batch.len(), 2);
    /// assert!(VectorBatch::new(&[1.0, 0.0, 0.0], 2).is_err());
    /// ```
    pub fn new(data: &'a [f32], dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidDimension(
                "dimension must be positive".to_string(),
            ));
        }
        if data.len() % dimension != 0 {
            return Err(Error::InvalidVectorLength {
                len: data.len(),
                dimension,
            });
        }
        Ok(Self { data, dimension })
    }

    /// Number of vectors in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    /// Returns true if the batch holds no vectors.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Floats per vector.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The underlying flat buffer.
    #[inline]
    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }

    /// Vector `i`, or `None` past the end.
    pub fn get(&self, i: usize) -> Option<&'a [f32]> {
        let start = i.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Iterates over the vectors.
    pub fn iter(&self) -> impl Iterator<Item = &'a [f32]> + 'a {
        self.data.chunks_exact(self.dimension)
    }

    /// Splits into consecutive sub-batches of at most `max_vectors` vectors.
    pub fn chunks(&self, max_vectors: usize) -> impl Iterator<Item = VectorBatch<'a>> + 'a {
        let dimension = self.dimension;
        self.data
            .chunks(max_vectors.max(1) * dimension)
            .map(move |data| VectorBatch { data, dimension })
    }
}

/// A validated, borrowed batch of packed binary codes.
#[derive(Debug, Clone, Copy)]
pub struct CodeBatch<'a> {
    data: &'a [u8],
    code_size: usize,
}

impl<'a> CodeBatch<'a> {
    /// Wraps a flat byte buffer of `code_size`-byte codes.
    pub fn new(data: &'a [u8], code_size: usize) -> Result<Self> {
        if code_size == 0 {
            return Err(Error::InvalidDimension(
                "code size must be positive".to_string(),
            ));
        }
        if data.len() % code_size != 0 {
            return Err(Error::InvalidVectorLength {
                len: data.len(),
                dimension: code_size,
            });
        }
        Ok(Self { data, code_size })
    }

    /// Number of codes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / self.code_size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    #[inline]
    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    /// Splits into consecutive sub-batches of at most `max_codes` codes.
    pub fn chunks(&self, max_codes: usize) -> impl Iterator<Item = CodeBatch<'a>> + 'a {
        let code_size = self.code_size;
        self.data
            .chunks(max_codes.max(1) * code_size)
            .map(move |data| CodeBatch { data, code_size })
    }
}

/// Flattens row vectors into one contiguous buffer, checking each row.
///
/// # Errors
///
/// Returns [`Error::InvalidDimension`] if any row's length differs from
/// `dimension`.
pub fn flatten(rows: &[Vec<f32>], dimension: usize) -> Result<Vec<f32>> {
    let mut flat = Vec::with_capacity(rows.len() * dimension);
    for (i, row) in rows.iter().enumerate() {
        if row.len() != dimension {
            return Err(Error::InvalidDimension(format!(
                "row {} has {} components, expected {}",
                i,
                row.len(),
                dimension
            )));
        }
        flat.extend_from_slice(row);
    }
    Ok(flat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_validation() {
        assert!(matches!(
            VectorBatch::new(&[1.0; 5], 2),
            Err(Error::InvalidVectorLength {
                len: 5,
                dimension: 2
            })
        ));
        assert!(matches!(
            VectorBatch::new(&[1.0; 4], 0),
            Err(Error::InvalidDimension(_))
        ));

        let empty = VectorBatch::new(&[], 8).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 0);
    }

    #[test]
    fn test_rows_and_chunks() {
        let data: Vec<f32> = (0..12).map(|x| x as f32).collect();
        let batch = VectorBatch::new(&data, 3).unwrap();

        assert_eq!(batch.get(1), Some(&[3.0, 4.0, 5.0][..]));
        assert_eq!(batch.get(4), None);
        assert_eq!(batch.iter().count(), 4);

        let sizes: Vec<usize> = batch.chunks(3).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 1]);
        let chunk = batch.chunks(3).nth(1).unwrap();
        assert_eq!(chunk.as_slice(), &[9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_code_batch() {
        let codes = [0u8; 16];
        let batch = CodeBatch::new(&codes, 4).unwrap();
        assert_eq!(batch.len(), 4);
        assert!(CodeBatch::new(&codes[..3], 4).is_err());

        let sizes: Vec<usize> = batch.chunks(3).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 1]);
        assert_eq!(batch.chunks(3).nth(1).unwrap().as_slice().len(), 4);
    }

    #[test]
    fn test_flatten() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert_eq!(flatten(&rows, 2).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(flatten(&[vec![1.0]], 2).is_err());
    }
}
