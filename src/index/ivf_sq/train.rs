//! Training pipeline: coarse centroids first, then codec parameters fitted
//! on the same sample (on residuals when the codec encodes by residual).
//!
//! Nothing here mutates an index; the caller installs the returned
//! [`TrainedState`] only once both stages have succeeded.

use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::{CodecConfig, TrainingConfig};
use crate::error::{IvfSqError, Result};
use crate::index::distance::subtract_into;
use crate::index::quantization::ScalarQuantizer;
use crate::resources::Resources;
use crate::types::DistanceMetric;

use super::assign::ListAssigner;
use super::kmeans::CentroidTrainer;

/// Below this many vectors per list k-means output is noisy.
const MIN_POINTS_PER_CENTROID: usize = 39;

/// Output of a successful training run.
#[derive(Debug, Clone)]
pub struct TrainedState {
    pub centroids: Vec<f32>,
    pub quantizer: ScalarQuantizer,
}

/// Everything a training run needs besides the sample itself.
#[derive(Clone, Copy)]
pub struct TrainRequest<'a> {
    pub dims: usize,
    pub nlist: usize,
    pub metric: DistanceMetric,
    pub codec: &'a CodecConfig,
    pub training: &'a TrainingConfig,
    pub trainer: &'a dyn CentroidTrainer,
}

/// Train centroids and codec parameters from a flat sample of `n * dims`
/// floats. Requires `n >= nlist`.
pub fn train_ivf_sq(
    request: &TrainRequest<'_>,
    sample: &[f32],
    res: &Resources,
) -> Result<TrainedState> {
    let TrainRequest {
        dims,
        nlist,
        metric,
        codec,
        training,
        trainer,
    } = *request;

    if sample.len() % dims != 0 {
        return Err(IvfSqError::DimensionMismatch {
            expected: dims,
            actual: sample.len(),
        });
    }
    let n = sample.len() / dims;
    if n < nlist {
        return Err(IvfSqError::InsufficientTrainingData {
            required: nlist,
            actual: n,
        });
    }
    if n < nlist * MIN_POINTS_PER_CENTROID {
        warn!(
            n,
            nlist,
            recommended = nlist * MIN_POINTS_PER_CENTROID,
            "training sample is small relative to nlist"
        );
    }

    info!(n, nlist, dims, %metric, "training coarse quantizer");
    let centroids = trainer.train_centroids(sample, dims, nlist, res)?;
    if centroids.len() != nlist * dims {
        return Err(IvfSqError::InternalInvariant(format!(
            "centroid trainer returned {} floats, expected {}",
            centroids.len(),
            nlist * dims
        )));
    }
    if centroids.iter().any(|v| !v.is_finite()) {
        return Err(IvfSqError::InternalInvariant(
            "centroid trainer returned non-finite values".into(),
        ));
    }

    let codec_sample = codec_subsample(sample, dims, training.max_codec_samples);
    let quantizer = if codec.by_residual {
        let residuals = residuals(&codec_sample, &centroids, dims, metric, res);
        ScalarQuantizer::train(&residuals, dims, codec)?
    } else {
        ScalarQuantizer::train(&codec_sample, dims, codec)?
    };

    info!(
        code_size = quantizer.code_size(),
        codec_samples = codec_sample.len() / dims,
        by_residual = codec.by_residual,
        "codec parameters trained"
    );

    Ok(TrainedState {
        centroids,
        quantizer,
    })
}

/// Evenly strided subsample of at most `cap` vectors.
fn codec_subsample(sample: &[f32], dims: usize, cap: Option<usize>) -> Vec<f32> {
    let n = sample.len() / dims;
    match cap {
        Some(cap) if cap > 0 && cap < n => {
            let mut out = Vec::with_capacity(cap * dims);
            for i in 0..cap {
                let src = i * n / cap;
                out.extend_from_slice(&sample[src * dims..(src + 1) * dims]);
            }
            out
        }
        _ => sample.to_vec(),
    }
}

/// `v - centroid(assign(v))` for every vector of the sample.
pub(crate) fn residuals(
    vectors: &[f32],
    centroids: &[f32],
    dims: usize,
    metric: DistanceMetric,
    res: &Resources,
) -> Vec<f32> {
    let assigner = ListAssigner::new(centroids, dims, metric);
    let mut out = vec![0.0f32; vectors.len()];
    res.install(|| {
        out.par_chunks_exact_mut(dims)
            .zip(vectors.par_chunks_exact(dims))
            .for_each(|(dst, v)| subtract_into(v, assigner.centroid(assigner.assign(v)), dst));
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ivf_sq::kmeans::KMeansTrainer;

    fn sample(n: usize, dims: usize) -> Vec<f32> {
        (0..n * dims).map(|i| ((i * 7919) % 1000) as f32 / 1000.0).collect()
    }

    fn request<'a>(
        codec: &'a CodecConfig,
        training: &'a TrainingConfig,
        trainer: &'a KMeansTrainer,
    ) -> TrainRequest<'a> {
        TrainRequest {
            dims: 4,
            nlist: 3,
            metric: DistanceMetric::L2,
            codec,
            training,
            trainer,
        }
    }

    #[test]
    fn test_train_produces_centroids_and_params() {
        let res = Resources::unbounded();
        let codec = CodecConfig::default();
        let training = TrainingConfig::default();
        let trainer = KMeansTrainer::default();
        let state = train_ivf_sq(&request(&codec, &training, &trainer), &sample(60, 4), &res)
            .unwrap();
        assert_eq!(state.centroids.len(), 12);
        assert_eq!(state.quantizer.dim(), 4);
        assert_eq!(state.quantizer.code_size(), 4);
    }

    #[test]
    fn test_insufficient_training_data() {
        let res = Resources::unbounded();
        let codec = CodecConfig::default();
        let training = TrainingConfig::default();
        let trainer = KMeansTrainer::default();
        let err = train_ivf_sq(&request(&codec, &training, &trainer), &sample(2, 4), &res)
            .unwrap_err();
        assert!(matches!(
            err,
            IvfSqError::InsufficientTrainingData {
                required: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_residual_ranges_are_tighter() {
        let res = Resources::unbounded();
        let training = TrainingConfig::default();
        let trainer = KMeansTrainer::default();
        // Two far-apart blobs: residual ranges collapse to the blob width.
        let mut data = Vec::new();
        for i in 0..40 {
            let jitter = (i % 5) as f32 * 0.01;
            data.extend_from_slice(&[jitter, jitter, jitter, jitter]);
            data.extend_from_slice(&[100.0 + jitter, 100.0, 100.0, 100.0 - jitter]);
        }
        let plain = CodecConfig::default();
        let residual = CodecConfig::default().with_residual(true);
        let mut req = request(&plain, &training, &trainer);
        req.nlist = 2;
        let a = train_ivf_sq(&req, &data, &res).unwrap();
        req.codec = &residual;
        let b = train_ivf_sq(&req, &data, &res).unwrap();
        assert!(a.quantizer.params().vdiff[1] > 99.0);
        assert!(b.quantizer.params().vdiff[0] < 1.0);
    }

    #[test]
    fn test_codec_subsample_cap() {
        let data = sample(10, 2);
        assert_eq!(codec_subsample(&data, 2, Some(4)).len(), 8);
        assert_eq!(codec_subsample(&data, 2, None).len(), 20);
        assert_eq!(codec_subsample(&data, 2, Some(50)).len(), 20);
    }
}
