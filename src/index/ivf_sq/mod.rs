//! IVF-SQ: inverted-file index over scalar-quantized codes.
//!
//! A coarse quantizer (trained centroids) splits the collection into `nlist`
//! inverted lists; each vector is compressed by a [`ScalarQuantizer`] and
//! appended to the list of its nearest centroid. Search probes the `nprobe`
//! nearest lists and ranks their entries with asymmetric distances computed
//! directly on the codes.
//!
//! ## Layout
//!
//! - [`kmeans`]: centroid training capability
//! - [`train`]: training pipeline (centroids, then codec parameters)
//! - [`assign`]: nearest-centroid assignment for adds and probes
//! - [`invlists`]: per-list code storage with exact memory accounting
//! - [`search`]: probing and bounded top-k merge
//! - [`portable`]: snapshot and binary transfer format

pub mod assign;
pub mod invlists;
pub mod kmeans;
pub mod portable;
pub mod search;
pub mod train;

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{CodecConfig, IndexConfig, TrainingConfig};
use crate::error::{IvfSqError, Result};
use crate::index::distance::subtract_into;
use crate::index::quantization::ScalarQuantizer;
use crate::index::traits::VectorIndex;
use crate::resources::Resources;
use crate::types::{DistanceMetric, IndexSummary, SearchResults, VectorId};

use assign::ListAssigner;
use invlists::InvertedLists;
use kmeans::{CentroidTrainer, KMeansTrainer};
use train::{train_ivf_sq, TrainRequest};

pub use portable::{PortableIndex, PortableList};
pub use search::TopK;

/// Resident IVF-SQ index.
///
/// Mutating operations take `&mut self` and searches take `&self`, so one
/// writer or many readers at a time; share behind `Arc<RwLock<_>>` if needed.
#[derive(Debug)]
pub struct IvfSqIndex {
    dims: usize,
    nlist: usize,
    nprobe: usize,
    metric: DistanceMetric,
    codec: CodecConfig,
    training: TrainingConfig,
    trained: bool,
    /// `nlist * dims` floats once trained, empty before.
    centroids: Vec<f32>,
    quantizer: Option<ScalarQuantizer>,
    lists: InvertedLists,
    trainer: Arc<dyn CentroidTrainer>,
    resources: Arc<Resources>,
}

impl IvfSqIndex {
    /// Create an empty, untrained index. `nprobe` starts at 1.
    pub fn new(
        dims: usize,
        nlist: usize,
        metric: DistanceMetric,
        codec: CodecConfig,
        resources: Arc<Resources>,
    ) -> Result<Self> {
        if dims == 0 {
            return Err(IvfSqError::InvalidArgument("dims must be > 0".into()));
        }
        if nlist == 0 {
            return Err(IvfSqError::InvalidArgument("nlist must be > 0".into()));
        }
        codec.validate()?;

        let code_size = ScalarQuantizer::code_size_for(dims, &codec);
        debug!(dims, nlist, %metric, code_size, "created ivf-sq index");
        Ok(Self {
            dims,
            nlist,
            nprobe: 1,
            metric,
            codec,
            training: TrainingConfig::default(),
            trained: false,
            centroids: Vec::new(),
            quantizer: None,
            lists: InvertedLists::new(nlist, code_size),
            trainer: Arc::new(KMeansTrainer::default()),
            resources,
        })
    }

    /// Create an index from the config tree.
    pub fn from_config(
        index: &IndexConfig,
        codec: &CodecConfig,
        training: &TrainingConfig,
        resources: Arc<Resources>,
    ) -> Result<Self> {
        let mut idx = Self::new(index.dims, index.nlist, index.metric, *codec, resources)?;
        idx.set_nprobe(index.nprobe)?;
        idx.training = training.clone();
        idx.trainer = Arc::new(KMeansTrainer::from_config(training));
        Ok(idx)
    }

    /// Replace the centroid training routine.
    pub fn with_trainer(mut self, trainer: Arc<dyn CentroidTrainer>) -> Self {
        self.trainer = trainer;
        self
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    /// Set the default probe count. Must be in `1..=nlist`.
    pub fn set_nprobe(&mut self, nprobe: usize) -> Result<()> {
        if nprobe == 0 || nprobe > self.nlist {
            return Err(IvfSqError::InvalidArgument(format!(
                "nprobe must be in 1..={}, got {nprobe}",
                self.nlist
            )));
        }
        self.nprobe = nprobe;
        Ok(())
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn codec(&self) -> &CodecConfig {
        &self.codec
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn total_count(&self) -> usize {
        self.lists.total_count()
    }

    pub fn code_size(&self) -> usize {
        self.lists.code_size()
    }

    pub fn list_length(&self, list_id: usize) -> usize {
        self.lists.list_length(list_id)
    }

    /// Trained centroids, row-major; empty before training.
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    pub fn quantizer(&self) -> Option<&ScalarQuantizer> {
        self.quantizer.as_ref()
    }

    pub fn lists(&self) -> &InvertedLists {
        &self.lists
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    /// Train centroids and codec parameters from `vectors` (`n * dims`
    /// floats, `n >= nlist`).
    ///
    /// On failure the previous training state is kept. An index that
    /// already holds vectors must be [`reset`](Self::reset) first.
    pub fn train(&mut self, vectors: &[f32]) -> Result<()> {
        if self.lists.total_count() > 0 {
            return Err(IvfSqError::InvalidArgument(format!(
                "index holds {} vectors; reset before retraining",
                self.lists.total_count()
            )));
        }
        check_finite(vectors, "training vectors")?;

        let request = TrainRequest {
            dims: self.dims,
            nlist: self.nlist,
            metric: self.metric,
            codec: &self.codec,
            training: &self.training,
            trainer: self.trainer.as_ref(),
        };
        match train_ivf_sq(&request, vectors, &self.resources) {
            Ok(state) => {
                self.centroids = state.centroids;
                self.quantizer = Some(state.quantizer);
                self.trained = true;
                crate::metrics::TRAININGS_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                info!(nlist = self.nlist, dims = self.dims, "index trained");
                Ok(())
            }
            Err(e) => {
                crate::metrics::TRAININGS_TOTAL
                    .with_label_values(&["failure"])
                    .inc();
                warn!(error = %e, "training failed, previous state kept");
                Err(e)
            }
        }
    }

    /// Add vectors with sequential ids starting at the current total count.
    pub fn add(&mut self, vectors: &[f32]) -> Result<()> {
        let n = vectors.len() / self.dims;
        let start = self.lists.total_count() as VectorId;
        let ids: Vec<VectorId> = (0..n as VectorId).map(|i| start + i).collect();
        self.add_with_ids(vectors, &ids)
    }

    /// Add vectors under caller-chosen ids.
    ///
    /// Either every vector is appended or, on error, none is.
    pub fn add_with_ids(&mut self, vectors: &[f32], ids: &[VectorId]) -> Result<()> {
        let quantizer = match (self.trained, self.quantizer.as_ref()) {
            (true, Some(q)) => q,
            _ => return Err(IvfSqError::NotTrained),
        };
        if vectors.len() % self.dims != 0 {
            return Err(IvfSqError::DimensionMismatch {
                expected: self.dims,
                actual: vectors.len(),
            });
        }
        let n = vectors.len() / self.dims;
        if ids.len() != n {
            return Err(IvfSqError::InvalidArgument(format!(
                "{} ids supplied for {n} vectors",
                ids.len()
            )));
        }
        check_finite(vectors, "vectors")?;
        if n == 0 {
            return Ok(());
        }

        let dims = self.dims;
        let code_size = quantizer.code_size();
        let by_residual = self.codec.by_residual;
        let assigner = ListAssigner::new(&self.centroids, dims, self.metric);
        let assignments = assigner.assign_batch(vectors, &self.resources);

        let mut codes = vec![0u8; n * code_size];
        self.resources.install(|| {
            codes
                .par_chunks_exact_mut(code_size)
                .zip(vectors.par_chunks_exact(dims))
                .zip(assignments.par_iter())
                .for_each_init(
                    || vec![0.0f32; dims],
                    |residual, ((code, v), &list_id)| {
                        if by_residual {
                            subtract_into(v, assigner.centroid(list_id), residual);
                            quantizer.encode_into(residual, code);
                        } else {
                            quantizer.encode_into(v, code);
                        }
                    },
                );
        });

        self.lists
            .append_batch(&assignments, ids, &codes, &self.resources)?;

        crate::metrics::VECTORS_ADDED_TOTAL.inc_by(n as u64);
        info!(
            added = n,
            total = self.lists.total_count(),
            "vectors added"
        );
        Ok(())
    }

    /// Search with the index's default `nprobe`.
    pub fn search(&self, queries: &[f32], k: usize) -> Result<SearchResults> {
        self.search_with_nprobe(queries, k, self.nprobe)
    }

    /// Search probing `nprobe` lists per query.
    pub fn search_with_nprobe(
        &self,
        queries: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<SearchResults> {
        search::search_ivf_sq(self, queries, k, nprobe)
    }

    /// Grow every list to a capacity of at least `ceil(num_vectors / nlist)`
    /// entries; lists already that large are untouched. This is a total
    /// per-list target, not room for `num_vectors` additional entries.
    /// Returns the bytes newly reserved.
    pub fn reserve(&mut self, num_vectors: usize) -> Result<usize> {
        let bytes = self.lists.reserve(num_vectors, &self.resources)?;
        info!(num_vectors, bytes, "reserved list storage");
        Ok(bytes)
    }

    /// Release unused list capacity. Returns the bytes freed.
    pub fn reclaim(&mut self) -> usize {
        self.lists.reclaim(&self.resources)
    }

    /// Remove every vector; centroids and codec parameters are kept.
    pub fn reset(&mut self) {
        self.lists.reset(&self.resources);
    }

    pub fn summary(&self) -> IndexSummary {
        IndexSummary {
            dims: self.dims,
            nlist: self.nlist,
            nprobe: self.nprobe,
            metric: self.metric,
            trained: self.trained,
            total_count: self.lists.total_count(),
            code_size: self.lists.code_size(),
            list_lengths: (0..self.nlist).map(|l| self.lists.list_length(l)).collect(),
            reserved_bytes: self.lists.reserved_bytes(),
            used_bytes: self.lists.used_bytes(),
        }
    }

    /// Log the index summary at info level.
    pub fn dump(&self) {
        let summary = self.summary();
        match serde_json::to_string(&summary) {
            Ok(json) => info!(summary = %json, "ivf-sq index"),
            Err(e) => warn!(error = %e, "failed to serialize index summary"),
        }
    }

    /// Verify internal consistency of the training state and the lists.
    pub fn check_invariants(&self) -> Result<()> {
        self.lists.check_invariants()?;
        if self.trained {
            if self.centroids.len() != self.nlist * self.dims {
                return Err(IvfSqError::InternalInvariant(format!(
                    "{} centroid floats for nlist {} x dims {}",
                    self.centroids.len(),
                    self.nlist,
                    self.dims
                )));
            }
            if self.quantizer.is_none() {
                return Err(IvfSqError::InternalInvariant(
                    "trained index has no codec parameters".into(),
                ));
            }
        }
        if self.nprobe == 0 || self.nprobe > self.nlist {
            return Err(IvfSqError::InternalInvariant(format!(
                "nprobe {} outside 1..={}",
                self.nprobe, self.nlist
            )));
        }
        Ok(())
    }
}

impl VectorIndex for IvfSqIndex {
    fn train(&mut self, vectors: &[f32]) -> Result<()> {
        IvfSqIndex::train(self, vectors)
    }

    fn add(&mut self, vectors: &[f32]) -> Result<()> {
        IvfSqIndex::add(self, vectors)
    }

    fn add_with_ids(&mut self, vectors: &[f32], ids: &[VectorId]) -> Result<()> {
        IvfSqIndex::add_with_ids(self, vectors, ids)
    }

    fn search(&self, queries: &[f32], k: usize) -> Result<SearchResults> {
        IvfSqIndex::search(self, queries, k)
    }

    fn reserve(&mut self, num_vectors: usize) -> Result<usize> {
        IvfSqIndex::reserve(self, num_vectors)
    }

    fn reclaim(&mut self) -> usize {
        IvfSqIndex::reclaim(self)
    }

    fn reset(&mut self) {
        IvfSqIndex::reset(self)
    }

    fn to_portable(&self) -> PortableIndex {
        IvfSqIndex::to_portable(self)
    }

    fn vector_count(&self) -> usize {
        self.lists.total_count()
    }

    fn dimension(&self) -> usize {
        self.dims
    }
}

impl Drop for IvfSqIndex {
    fn drop(&mut self) {
        self.resources
            .budget()
            .release(self.lists.reserved_bytes());
    }
}

fn check_finite(values: &[f32], what: &str) -> Result<()> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(IvfSqError::InvalidArgument(format!(
            "{what} must not contain NaN or infinite values"
        )));
    }
    Ok(())
}
