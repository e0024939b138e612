//! Core trait definition for vector index implementations.
//!
//! Every resident backend implements `VectorIndex` so callers can drive
//! training, ingestion, search and transfer without knowing the concrete
//! index type.

use crate::error::Result;
use crate::index::ivf_sq::PortableIndex;
use crate::types::{SearchResults, VectorId};

/// Capability interface shared by index backends.
///
/// All vector arguments are flat row-major slices of `n * dimension()`
/// floats. The trait is object-safe so a `Box<dyn VectorIndex>` can be held
/// when the backend is chosen at runtime.
pub trait VectorIndex: Send + Sync {
    /// Train the index from a representative sample.
    ///
    /// # Errors
    /// `InsufficientTrainingData` when the sample is smaller than the list
    /// count, `InvalidArgument` when the index already holds vectors.
    fn train(&mut self, vectors: &[f32]) -> Result<()>;

    /// Add vectors under sequential ids starting at the current count.
    fn add(&mut self, vectors: &[f32]) -> Result<()>;

    /// Add vectors under caller-chosen ids. Nothing is added on error.
    fn add_with_ids(&mut self, vectors: &[f32], ids: &[VectorId]) -> Result<()>;

    /// Return the `k` nearest neighbors of every query, best first, padded
    /// with sentinel entries.
    ///
    /// # Errors
    /// `NotTrained`, `DimensionMismatch`, or `InvalidArgument` for `k == 0`.
    fn search(&self, queries: &[f32], k: usize) -> Result<SearchResults>;

    /// Grow storage so that `num_vectors` entries spread evenly across the
    /// index's partitions fit without reallocation. Partitions already that
    /// large are left alone. Returns the bytes newly reserved.
    fn reserve(&mut self, num_vectors: usize) -> Result<usize>;

    /// Release unused storage, returning the bytes freed.
    fn reclaim(&mut self) -> usize;

    /// Remove every vector but keep the trained state.
    fn reset(&mut self);

    /// Snapshot the full index state for transfer.
    fn to_portable(&self) -> PortableIndex;

    /// Return the total number of vectors in this index.
    fn vector_count(&self) -> usize;

    /// Return the dimensionality of vectors in this index.
    fn dimension(&self) -> usize;
}
