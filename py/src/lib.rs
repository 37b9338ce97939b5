#![allow(clippy::useless_conversion)]
use std::sync::OnceLock;

use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use vecgate_core::{EngineConfig, Error, MetricType, Runtime};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn to_py_err(e: Error) -> PyErr {
    match e {
        Error::Io(msg) => PyIOError::new_err(msg),
        other => PyValueError::new_err(other.to_string()),
    }
}

fn runtime() -> PyResult<Runtime> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt.clone());
    }
    let rt = Runtime::from_env(EngineConfig::default()).map_err(to_py_err)?;
    Ok(RUNTIME.get_or_init(|| rt).clone())
}

fn parse_metric(metric: &str) -> PyResult<MetricType> {
    match metric {
        "l2" | "euclidean" => Ok(MetricType::L2),
        "ip" | "dot" | "inner_product" => Ok(MetricType::InnerProduct),
        _ => Err(PyValueError::new_err("Invalid metric")),
    }
}

/// Flattens row vectors, rejecting rows of the wrong width.
fn flatten(rows: Vec<Vec<f32>>, dimension: usize) -> PyResult<Vec<f32>> {
    let mut flat = Vec::with_capacity(rows.len() * dimension);
    for (i, row) in rows.into_iter().enumerate() {
        if row.len() != dimension {
            return Err(PyValueError::new_err(format!(
                "row {} has {} components, expected {}",
                i,
                row.len(),
                dimension
            )));
        }
        flat.extend(row);
    }
    Ok(flat)
}

#[pyclass]
/// A native vector index.
///
/// Native memory is freed by `close()`, by leaving a `with` block, or when
/// the object is garbage collected, whichever happens first.
struct Index {
    inner: vecgate_core::Index,
}

#[pymethods]
impl Index {
    #[new]
    #[pyo3(signature = (dimension, metric = "l2"))]
    /// Create an exact (flat) index.
    ///
    /// Args:
    ///     dimension (int): Dimension of the vectors.
    ///     metric (str): "l2" or "ip".
    fn new(dimension: usize, metric: &str) -> PyResult<Self> {
        let inner = vecgate_core::Index::flat(&runtime()?, dimension, parse_metric(metric)?)
            .map_err(to_py_err)?;
        Ok(Index { inner })
    }

    #[staticmethod]
    #[pyo3(signature = (dimension, description, metric = "l2"))]
    /// Create an index from a pipeline description such as "IVF100,Flat".
    fn from_description(dimension: usize, description: &str, metric: &str) -> PyResult<Self> {
        let inner = vecgate_core::Index::from_description(
            &runtime()?,
            dimension,
            description,
            parse_metric(metric)?,
        )
        .map_err(to_py_err)?;
        Ok(Index { inner })
    }

    #[staticmethod]
    /// Load an index written by `write`.
    fn read(path: &str) -> PyResult<Self> {
        let inner = vecgate_core::Index::read(&runtime()?, path).map_err(to_py_err)?;
        Ok(Index { inner })
    }

    #[getter]
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    #[getter]
    fn is_trained(&self) -> bool {
        self.inner.is_trained()
    }

    #[getter]
    fn is_closed(&self) -> bool {
        self.inner.is_released()
    }

    fn __len__(&self) -> usize {
        self.inner.len()
    }

    /// Train the index on a sample of vectors.
    ///
    /// Args:
    ///     vectors (list[list[float]]): Training vectors.
    fn train(&mut self, vectors: Vec<Vec<f32>>) -> PyResult<()> {
        let flat = flatten(vectors, self.inner.dimension())?;
        self.inner.train(&flat).map_err(to_py_err)
    }

    /// Add vectors, labelled sequentially from the current length.
    ///
    /// Args:
    ///     vectors (list[list[float]]): Vectors to add.
    fn add(&mut self, vectors: Vec<Vec<f32>>) -> PyResult<()> {
        let flat = flatten(vectors, self.inner.dimension())?;
        self.inner.add(&flat).map_err(to_py_err)
    }

    /// Add vectors under caller-chosen ids. Only id-mapped indexes accept this.
    ///
    /// Args:
    ///     vectors (list[list[float]]): Vectors to add.
    ///     ids (list[int]): One id per vector.
    fn add_with_ids(&mut self, vectors: Vec<Vec<f32>>, ids: Vec<i64>) -> PyResult<()> {
        let flat = flatten(vectors, self.inner.dimension())?;
        self.inner.add_with_ids(&flat, &ids).map_err(to_py_err)
    }

    /// Search for nearest neighbors for multiple queries.
    ///
    /// Args:
    ///     queries (list[list[float]]): Query vectors.
    ///     k (int): Number of neighbors per query.
    ///
    /// Returns:
    ///     list[list[tuple[int, float]]]: (label, distance) pairs per query.
    ///     Queries with fewer than k neighbors return shorter lists.
    fn search(&self, queries: Vec<Vec<f32>>, k: usize) -> PyResult<Vec<Vec<(i64, f32)>>> {
        let flat = flatten(queries, self.inner.dimension())?;
        let results = self.inner.search(&flat, k).map_err(to_py_err)?;
        Ok((0..results.num_queries())
            .map(|i| {
                results
                    .neighbors(i)
                    .into_iter()
                    .map(|n| (n.label, n.distance))
                    .collect()
            })
            .collect())
    }

    /// Return every stored vector within `radius` of each query.
    ///
    /// Returns:
    ///     list[list[tuple[int, float]]]: (label, distance) pairs per query.
    fn range_search(
        &self,
        queries: Vec<Vec<f32>>,
        radius: f32,
    ) -> PyResult<Vec<Vec<(i64, f32)>>> {
        let flat = flatten(queries, self.inner.dimension())?;
        let result = self.inner.range_search(&flat, radius).map_err(to_py_err)?;
        Ok(result
            .iter()
            .map(|(labels, distances)| {
                labels.iter().copied().zip(distances.iter().copied()).collect()
            })
            .collect())
    }

    /// Remove every stored vector.
    fn reset(&mut self) -> PyResult<()> {
        self.inner.reset().map_err(to_py_err)
    }

    /// Write the index to a file.
    fn write(&self, path: &str) -> PyResult<()> {
        self.inner.write(path).map_err(to_py_err)
    }

    /// Set a search-time parameter such as "nprobe" or "efSearch".
    fn set_parameter(&mut self, name: &str, value: f64) -> PyResult<()> {
        self.inner.set_parameter(name, value).map_err(to_py_err)
    }

    /// Free the native index. Safe to call more than once.
    fn close(&self) -> PyResult<()> {
        self.inner.release().map_err(to_py_err)
    }

    fn __enter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    #[pyo3(signature = (*_args))]
    fn __exit__(&self, _args: &Bound<'_, pyo3::types::PyTuple>) -> PyResult<bool> {
        self.close()?;
        Ok(false)
    }

    fn __repr__(&self) -> String {
        format!(
            "Index(kind={:?}, dimension={}, metric={}, len={})",
            self.inner.kind(),
            self.inner.dimension(),
            self.inner.metric(),
            self.inner.len()
        )
    }
}

#[pymodule]
fn _vecgate(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Index>()?;
    Ok(())
}
