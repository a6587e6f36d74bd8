//! Public HNSW index: labels, tombstones, batch operations and persistence.
//!
//! [`HnswIndex`] wraps the graph in a process-wide reader/writer lock. Inserts,
//! searches, lookups and tombstone updates share it and synchronise among
//! themselves through per-slot locks; resize, save and load take it exclusively.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{IndexConfig, Space};
use crate::distance::Distance;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::persist;
use crate::store::{Label, NodeId};

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Label the element was inserted under.
    pub label: Label,
    /// Distance to the query in the index's space (lower = closer).
    pub distance: f32,
}

/// Approximate nearest neighbor index over labelled `f32` vectors.
#[derive(Debug)]
pub struct HnswIndex {
    space: Space,
    dim: usize,
    distance: Distance,
    state: RwLock<Graph>,
    ef: AtomicUsize,
    num_threads: AtomicUsize,
    pool: RwLock<Option<Arc<rayon::ThreadPool>>>,
}

fn build_pool(num_threads: usize) -> Result<Option<Arc<rayon::ThreadPool>>> {
    if num_threads == 0 {
        return Ok(None);
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map(|pool| Some(Arc::new(pool)))
        .map_err(|e| Error::InvalidParameter(format!("failed to build thread pool: {}", e)))
}

fn check_capacity(max_elements: usize) -> Result<()> {
    if max_elements > u32::MAX as usize {
        return Err(Error::InvalidParameter(format!(
            "capacity {} exceeds the internal id space",
            max_elements
        )));
    }
    Ok(())
}

/// Run `f` on a contiguous view of `row`, copying only when it is strided.
fn with_row<R>(row: ArrayView1<'_, f32>, f: impl FnOnce(&[f32]) -> R) -> R {
    match row.as_slice() {
        Some(slice) => f(slice),
        None => f(&row.to_vec()),
    }
}

impl HnswIndex {
    /// Create an empty index for `dim`-dimensional vectors in `space`, with
    /// room for `max_elements` elements.
    pub fn new(space: Space, dim: usize, max_elements: usize, config: IndexConfig) -> Result<Self> {
        if dim == 0 {
            return Err(Error::Config("dimension must be positive".to_string()));
        }
        config.validate()?;
        check_capacity(max_elements).map_err(|e| Error::Config(e.to_string()))?;
        let pool = build_pool(config.num_threads).map_err(|e| Error::Config(e.to_string()))?;

        let distance = Distance::new(space, dim);
        Ok(Self {
            space,
            dim,
            distance,
            state: RwLock::new(Graph::new(distance, max_elements, &config)),
            ef: AtomicUsize::new(config.ef_search),
            num_threads: AtomicUsize::new(config.num_threads),
            pool: RwLock::new(pool),
        })
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Distance space.
    pub fn space(&self) -> Space {
        self.space
    }

    /// Number of stored elements, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.state.read().store.len()
    }

    /// Check if the index holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements that are not tombstoned.
    pub fn live_len(&self) -> usize {
        self.state.read().store.live_len()
    }

    /// Maximum number of elements before a resize is needed.
    pub fn capacity(&self) -> usize {
        self.state.read().store.capacity()
    }

    /// Current configuration. Construction parameters reflect the last load.
    pub fn config(&self) -> IndexConfig {
        let graph = self.state.read();
        IndexConfig {
            m: graph.m(),
            m0: graph.m0(),
            ef_construction: graph.ef_construction(),
            ef_search: self.ef(),
            seed: graph.seed(),
            num_threads: self.num_threads(),
        }
    }

    /// Default search beam width.
    pub fn ef(&self) -> usize {
        self.ef.load(Ordering::Relaxed)
    }

    /// Set the default search beam width used by [`search`](Self::search).
    pub fn set_ef(&self, ef: usize) {
        self.ef.store(ef, Ordering::Relaxed);
    }

    /// Worker threads for batch operations (0 = global rayon pool).
    pub fn num_threads(&self) -> usize {
        self.num_threads.load(Ordering::Relaxed)
    }

    /// Set the worker count for batch operations. 0 falls back to the global pool.
    pub fn set_num_threads(&self, num_threads: usize) -> Result<()> {
        let pool = build_pool(num_threads)?;
        *self.pool.write() = pool;
        self.num_threads.store(num_threads, Ordering::Relaxed);
        Ok(())
    }

    fn run_batch<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        let pool = self.pool.read().clone();
        match pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Insert one vector under `label`. Returns its internal id.
    ///
    /// Fails before any state changes on a wrong dimension, a label already in
    /// use (tombstoned labels included) or a full index.
    pub fn insert(&self, vector: &[f32], label: Label) -> Result<NodeId> {
        self.distance.check(vector)?;
        self.state.read().insert(label, vector)
    }

    /// Insert the rows of `vectors` in parallel, row `i` under `labels[i]`.
    ///
    /// Returns the internal ids in input order. Rows are independent: when one
    /// fails, the others may already be inserted.
    pub fn batch_insert(&self, vectors: ArrayView2<'_, f32>, labels: &[Label]) -> Result<Vec<NodeId>> {
        let (rows, dim) = vectors.dim();
        if rows != labels.len() {
            return Err(Error::InvalidParameter(format!(
                "{} vectors but {} labels",
                rows,
                labels.len()
            )));
        }
        if dim != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                got: dim,
            });
        }

        tracing::debug!(rows, threads = self.num_threads(), "batch insert");
        let graph = self.state.read();
        let graph = &*graph;
        self.run_batch(|| {
            vectors
                .axis_iter(Axis(0))
                .into_par_iter()
                .zip(labels.par_iter())
                .map(|(row, &label)| with_row(row, |v| graph.insert(label, v)))
                .collect()
        })
    }

    /// k nearest live elements using the default beam width.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.search_with_ef(query, k, self.ef())
    }

    /// k nearest live elements with an explicit beam width (raised to `k` if
    /// smaller). Results are sorted by ascending distance.
    pub fn search_with_ef(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<SearchResult>> {
        self.distance.check(query)?;
        let graph = self.state.read();
        Ok(Self::to_results(&graph, graph.search(query, k, ef)))
    }

    /// Search every row of `queries` in parallel.
    pub fn batch_search(&self, queries: ArrayView2<'_, f32>, k: usize) -> Result<Vec<Vec<SearchResult>>> {
        let (rows, dim) = queries.dim();
        if dim != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                got: dim,
            });
        }

        tracing::debug!(rows, k, threads = self.num_threads(), "batch search");
        let ef = self.ef();
        let graph = self.state.read();
        let graph = &*graph;
        Ok(self.run_batch(|| {
            queries
                .axis_iter(Axis(0))
                .into_par_iter()
                .map(|row| with_row(row, |q| Self::to_results(graph, graph.search(q, k, ef))))
                .collect()
        }))
    }

    fn to_results(graph: &Graph, hits: Vec<(f32, NodeId)>) -> Vec<SearchResult> {
        hits.into_iter()
            .filter_map(|(distance, id)| {
                graph
                    .store
                    .label(id)
                    .map(|label| SearchResult { label, distance })
            })
            .collect()
    }

    /// Tombstone `label`: it stays in the graph for routing but is no longer
    /// returned. Idempotent.
    pub fn mark_deleted(&self, label: Label) -> Result<()> {
        let graph = self.state.read();
        let id = graph.store.id_of(label)?;
        graph.store.set_deleted(id, true);
        Ok(())
    }

    /// Clear the tombstone of `label`. Idempotent.
    pub fn unmark_deleted(&self, label: Label) -> Result<()> {
        let graph = self.state.read();
        let id = graph.store.id_of(label)?;
        graph.store.set_deleted(id, false);
        Ok(())
    }

    /// Whether `label` is tombstoned.
    pub fn is_deleted(&self, label: Label) -> Result<bool> {
        let graph = self.state.read();
        let id = graph.store.id_of(label)?;
        Ok(graph.store.is_deleted(id))
    }

    /// Copy of the vector stored under a live `label`.
    pub fn get_vector(&self, label: Label) -> Result<Vec<f32>> {
        let graph = self.state.read();
        let id = graph.store.id_of(label)?;
        if graph.store.is_deleted(id) {
            return Err(Error::NotFound(label));
        }
        graph
            .store
            .vector(id)
            .map(<[f32]>::to_vec)
            .ok_or(Error::NotFound(label))
    }

    /// Vectors of several live labels, one row per label.
    pub fn get_vectors(&self, labels: &[Label]) -> Result<Array2<f32>> {
        let mut out = Array2::zeros((labels.len(), self.dim));
        for (mut row, &label) in out.axis_iter_mut(Axis(0)).zip(labels) {
            let vector = self.get_vector(label)?;
            row.assign(&ArrayView1::from(&vector[..]));
        }
        Ok(out)
    }

    /// Lazy iterator over the labels of live elements, in insertion order.
    ///
    /// Each step takes the shared lock briefly, so the iterator can outlive
    /// concurrent inserts and deletes. Elements inserted after the iterator was
    /// created are not visited.
    pub fn labels(&self) -> ActiveLabels<'_> {
        ActiveLabels {
            index: self,
            next: 0,
            end: self.len(),
        }
    }

    /// Raise the capacity to `new_capacity`.
    ///
    /// Smaller values that still hold every element are a no-op.
    pub fn resize(&self, new_capacity: usize) -> Result<()> {
        check_capacity(new_capacity)?;
        let mut graph = self.state.write();
        let count = graph.store.len();
        if new_capacity < count {
            return Err(Error::InvalidParameter(format!(
                "cannot resize to {} below the current count {}",
                new_capacity, count
            )));
        }

        let old = graph.store.capacity();
        if new_capacity > old {
            graph.store.grow(new_capacity);
            tracing::debug!(old, new = new_capacity, "resized index");
        }
        Ok(())
    }

    /// Verify the graph's structural invariants.
    ///
    /// Takes the exclusive lock so the graph is quiescent while it is checked.
    pub fn check_integrity(&self) -> Result<()> {
        self.state.write().check_invariants()
    }

    /// Serialize the index to `writer`.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<()> {
        let graph = self.state.write();
        let bytes = persist::encode(&graph, self.space)?;
        writer.write_all(&bytes)?;
        writer.flush()?;

        let crc = bytes
            .last_chunk::<4>()
            .map_or(0, |footer| u32::from_le_bytes(*footer));
        tracing::info!(
            elements = graph.store.len(),
            bytes = bytes.len(),
            crc,
            "saved index"
        );
        Ok(())
    }

    /// Replace the index contents with data read from `reader`.
    ///
    /// The data is fully validated before anything is swapped in; on error the
    /// current contents are untouched. Capacity and construction parameters come
    /// from the data, the search beam width and thread count are kept.
    pub fn load<R: Read>(&self, mut reader: R) -> Result<()> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        let (graph, _) = match persist::decode(&bytes, self.space, self.dim) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(bytes = bytes.len(), error = %e, "rejected index data");
                return Err(e);
            }
        };

        let elements = graph.store.len();
        *self.state.write() = graph;
        tracing::info!(elements, bytes = bytes.len(), "loaded index");
        Ok(())
    }

    /// Save to `path` atomically (write to a temp file, then rename).
    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let temp_path = temp_path_for(path);

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        self.save(&mut writer)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Load from a file written by [`save_file`](Self::save_file).
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::open(path.as_ref())?;
        self.load(BufReader::new(file))
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Iterator returned by [`HnswIndex::labels`].
///
/// Cloning it yields an independent iterator starting from the same position.
#[derive(Debug, Clone)]
pub struct ActiveLabels<'a> {
    index: &'a HnswIndex,
    next: usize,
    end: usize,
}

impl Iterator for ActiveLabels<'_> {
    type Item = Label;

    fn next(&mut self) -> Option<Label> {
        let graph = self.index.state.read();
        let end = self.end.min(graph.store.len());
        while self.next < end {
            let id = self.next as NodeId;
            self.next += 1;
            if !graph.store.is_deleted(id) {
                if let Some(label) = graph.store.label(id) {
                    return Some(label);
                }
            }
        }
        self.next = self.end;
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end.saturating_sub(self.next)))
    }
}
