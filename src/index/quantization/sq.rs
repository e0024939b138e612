//! Scalar quantizer: per-dimension compression of f32 vectors into
//! fixed-size codes.
//!
//! For uniform codes each dimension `d` owns a trained range
//! `[vmin[d], vmin[d] + vdiff[d]]` split into `L = 2^bits - 1` steps.
//! Encoding rounds to the nearest level, so for values inside the trained
//! range the reconstruction error per dimension is at most
//! `vdiff[d] / (2 * L)`, which never exceeds `(max - min) / 2^bits`.
//! Values outside the range clamp to its ends.
//!
//! Float16 codes store each component as a little-endian IEEE half. The
//! error grows with magnitude rather than with the trained range: for an
//! in-range value it is at most `max(|vmin|, |vmin + vdiff|) * 2^-11`, and
//! never below half a subnormal step (`2^-25`).
//!
//! ## Code layout
//!
//! ```text
//! uniform: ceil(dim * bits / 8) bytes, dimension d at bit offset d * bits (LSB first)
//! float16: [f16_le * dim]
//! ```

use half::f16;
use serde::{Deserialize, Serialize};

use crate::config::CodecConfig;
use crate::error::{IvfSqError, Result};
use crate::index::distance::compute_distance;
use crate::types::DistanceMetric;

use super::{RangeStat, StoragePrecision};

/// Relative rounding error of a normal half (`2^-11`).
const F16_UNIT_ROUNDOFF: f32 = 1.0 / 2048.0;
/// Half the spacing of half subnormals (`2^-25`).
const F16_SUBNORMAL_HALF_STEP: f32 = 1.0 / 33_554_432.0;

/// Trained per-dimension quantization ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecParams {
    pub vmin: Vec<f32>,
    pub vdiff: Vec<f32>,
}

/// Encoder/decoder for list codes.
#[derive(Debug, Clone)]
pub struct ScalarQuantizer {
    dim: usize,
    precision: StoragePrecision,
    bits: usize,
    params: CodecParams,
    /// Precomputed `vdiff / L` per dimension (for decoding).
    steps: Vec<f32>,
    code_size: usize,
}

impl ScalarQuantizer {
    /// Bytes per code for `dim` dimensions under `config`.
    pub fn code_size_for(dim: usize, config: &CodecConfig) -> usize {
        match config.storage_precision {
            StoragePrecision::Quantized => (dim * config.bits_per_dimension as usize).div_ceil(8),
            StoragePrecision::Float16 => dim * 2,
        }
    }

    /// Fit per-dimension ranges from a flat sample (`n * dim` floats).
    pub fn train(sample: &[f32], dim: usize, config: &CodecConfig) -> Result<Self> {
        config.validate()?;
        if dim == 0 || sample.len() % dim != 0 {
            return Err(IvfSqError::DimensionMismatch {
                expected: dim,
                actual: sample.len(),
            });
        }
        let n = sample.len() / dim;
        if n == 0 {
            return Err(IvfSqError::InsufficientTrainingData {
                required: 1,
                actual: 0,
            });
        }

        let (vmin, vmax) = match config.range_stat {
            RangeStat::MinMax => min_max_ranges(sample, dim, config.range_stat_arg),
            RangeStat::MeanStd => mean_std_ranges(sample, dim, n, config.range_stat_arg),
        };

        let vdiff = vmin
            .iter()
            .zip(vmax.iter())
            .map(|(&lo, &hi)| {
                let range = hi - lo;
                // Constant dimension: every value encodes to level 0.
                if range < f32::EPSILON {
                    0.0
                } else {
                    range
                }
            })
            .collect();

        Self::from_params(dim, config, CodecParams { vmin, vdiff })
    }

    /// Rebuild a quantizer from previously trained parameters.
    pub fn from_params(dim: usize, config: &CodecConfig, params: CodecParams) -> Result<Self> {
        config.validate()?;
        if params.vmin.len() != dim || params.vdiff.len() != dim {
            return Err(IvfSqError::InvalidArgument(format!(
                "codec params cover {}/{} dimensions, expected {dim}",
                params.vmin.len(),
                params.vdiff.len()
            )));
        }
        if params
            .vmin
            .iter()
            .chain(params.vdiff.iter())
            .any(|v| !v.is_finite())
            || params.vdiff.iter().any(|&v| v < 0.0)
        {
            return Err(IvfSqError::InvalidArgument(
                "codec params must be finite with non-negative ranges".into(),
            ));
        }

        let bits = config.bits_per_dimension as usize;
        let levels = ((1usize << bits) - 1) as f32;
        let steps = params.vdiff.iter().map(|&v| v / levels).collect();

        Ok(Self {
            dim,
            precision: config.storage_precision,
            bits,
            code_size: Self::code_size_for(dim, config),
            params,
            steps,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn precision(&self) -> StoragePrecision {
        self.precision
    }

    pub fn params(&self) -> &CodecParams {
        &self.params
    }

    /// Worst-case absolute reconstruction error for dimension `d` of an
    /// in-range value.
    pub fn error_bound(&self, d: usize) -> f32 {
        match self.precision {
            StoragePrecision::Quantized => self.steps[d] / 2.0,
            StoragePrecision::Float16 => {
                let lo = self.params.vmin[d];
                let hi = lo + self.params.vdiff[d];
                let magnitude = lo.abs().max(hi.abs());
                (magnitude * F16_UNIT_ROUNDOFF).max(F16_SUBNORMAL_HALF_STEP)
            }
        }
    }

    /// Encode `vector` into `out` (`out.len() == code_size`).
    pub fn encode_into(&self, vector: &[f32], out: &mut [u8]) {
        debug_assert_eq!(vector.len(), self.dim);
        debug_assert_eq!(out.len(), self.code_size);
        match self.precision {
            StoragePrecision::Quantized => {
                out.fill(0);
                let top = ((1usize << self.bits) - 1) as f32;
                for (d, &v) in vector.iter().enumerate() {
                    let vdiff = self.params.vdiff[d];
                    let level = if vdiff > 0.0 {
                        (((v - self.params.vmin[d]) / vdiff).clamp(0.0, 1.0) * top).round() as usize
                    } else {
                        0
                    };
                    write_bits(out, d, self.bits, level);
                }
            }
            StoragePrecision::Float16 => {
                let limit = f16::MAX.to_f32();
                for (d, &v) in vector.iter().enumerate() {
                    let h = f16::from_f32(v.clamp(-limit, limit));
                    out[2 * d..2 * d + 2].copy_from_slice(&h.to_le_bytes());
                }
            }
        }
    }

    /// Encode a single vector to a freshly allocated code.
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut code = vec![0u8; self.code_size];
        self.encode_into(vector, &mut code);
        code
    }

    /// Decode `code` into `out` (`out.len() == dim`).
    pub fn decode_into(&self, code: &[u8], out: &mut [f32]) {
        debug_assert_eq!(code.len(), self.code_size);
        debug_assert_eq!(out.len(), self.dim);
        for (d, slot) in out.iter_mut().enumerate() {
            *slot = self.component(code, d);
        }
    }

    /// Decode a code back to an approximate f32 vector.
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dim];
        self.decode_into(code, &mut out);
        out
    }

    #[inline]
    fn component(&self, code: &[u8], d: usize) -> f32 {
        match self.precision {
            StoragePrecision::Quantized => {
                let level = read_bits(code, d, self.bits);
                self.params.vmin[d] + level as f32 * self.steps[d]
            }
            StoragePrecision::Float16 => f16::from_le_bytes([code[2 * d], code[2 * d + 1]]).to_f32(),
        }
    }

    /// Build a per-query scorer for repeated asymmetric distance evaluation.
    ///
    /// Uniform codes get a `dim * 2^bits` lookup table holding the distance
    /// contribution of every level, so scanning a code is one table read per
    /// dimension and nothing is decoded.
    pub fn scorer(&self, query: &[f32], metric: DistanceMetric) -> AsymmetricScorer<'_> {
        debug_assert_eq!(query.len(), self.dim);
        let repr = match self.precision {
            StoragePrecision::Quantized => {
                let ncodes = 1usize << self.bits;
                let mut table = Vec::with_capacity(self.dim * ncodes);
                for (d, &q) in query.iter().enumerate() {
                    let vmin = self.params.vmin[d];
                    let step = self.steps[d];
                    table.extend((0..ncodes).map(|level| {
                        let x = vmin + level as f32 * step;
                        match metric {
                            DistanceMetric::L2 => (q - x) * (q - x),
                            DistanceMetric::InnerProduct => q * x,
                        }
                    }));
                }
                ScorerRepr::Table { ncodes, table }
            }
            StoragePrecision::Float16 => ScorerRepr::Half {
                query: query.to_vec(),
            },
        };
        AsymmetricScorer {
            sq: self,
            metric,
            repr,
        }
    }

    /// One-shot asymmetric distance between a full-precision query and a code.
    pub fn asymmetric_distance(&self, query: &[f32], code: &[u8], metric: DistanceMetric) -> f32 {
        self.scorer(query, metric).distance(code)
    }

    /// Exact distance between `query` and the decoded code. Reference path
    /// for testing the asymmetric scorer.
    pub fn decoded_distance(&self, query: &[f32], code: &[u8], metric: DistanceMetric) -> f32 {
        compute_distance(query, &self.decode(code), metric)
    }
}

enum ScorerRepr {
    Table { ncodes: usize, table: Vec<f32> },
    Half { query: Vec<f32> },
}

/// Query-specialised distance evaluator over codes of one quantizer.
pub struct AsymmetricScorer<'a> {
    sq: &'a ScalarQuantizer,
    metric: DistanceMetric,
    repr: ScorerRepr,
}

impl AsymmetricScorer<'_> {
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// L2-squared or inner product between the query and `code`.
    #[inline]
    pub fn distance(&self, code: &[u8]) -> f32 {
        debug_assert_eq!(code.len(), self.sq.code_size);
        match &self.repr {
            ScorerRepr::Table { ncodes, table } => {
                if self.sq.bits == 8 {
                    code.iter()
                        .enumerate()
                        .map(|(d, &c)| table[d * ncodes + c as usize])
                        .sum()
                } else {
                    (0..self.sq.dim)
                        .map(|d| table[d * ncodes + read_bits(code, d, self.sq.bits)])
                        .sum()
                }
            }
            ScorerRepr::Half { query } => query
                .iter()
                .zip(code.chunks_exact(2))
                .map(|(&q, c)| {
                    let x = f16::from_le_bytes([c[0], c[1]]).to_f32();
                    match self.metric {
                        DistanceMetric::L2 => (q - x) * (q - x),
                        DistanceMetric::InnerProduct => q * x,
                    }
                })
                .sum(),
        }
    }
}

fn min_max_ranges(sample: &[f32], dim: usize, arg: f32) -> (Vec<f32>, Vec<f32>) {
    let mut mins = vec![f32::MAX; dim];
    let mut maxs = vec![f32::MIN; dim];
    for vec in sample.chunks_exact(dim) {
        for (d, &val) in vec.iter().enumerate() {
            if val < mins[d] {
                mins[d] = val;
            }
            if val > maxs[d] {
                maxs[d] = val;
            }
        }
    }
    if arg > 0.0 {
        for d in 0..dim {
            let widen = (maxs[d] - mins[d]) * arg;
            mins[d] -= widen;
            maxs[d] += widen;
        }
    }
    (mins, maxs)
}

fn mean_std_ranges(sample: &[f32], dim: usize, n: usize, arg: f32) -> (Vec<f32>, Vec<f32>) {
    let mut sum = vec![0.0f64; dim];
    let mut sum_sq = vec![0.0f64; dim];
    for vec in sample.chunks_exact(dim) {
        for (d, &val) in vec.iter().enumerate() {
            let v = val as f64;
            sum[d] += v;
            sum_sq[d] += v * v;
        }
    }
    let inv_n = 1.0 / n as f64;
    let mut mins = Vec::with_capacity(dim);
    let mut maxs = Vec::with_capacity(dim);
    for d in 0..dim {
        let mean = sum[d] * inv_n;
        let var = (sum_sq[d] * inv_n - mean * mean).max(0.0);
        let half_width = var.sqrt() * arg as f64;
        mins.push((mean - half_width) as f32);
        maxs.push((mean + half_width) as f32);
    }
    (mins, maxs)
}

#[inline]
fn read_bits(code: &[u8], idx: usize, bits: usize) -> usize {
    let bit = idx * bits;
    let byte = bit / 8;
    let shift = bit % 8;
    let mut word = code[byte] as u16;
    if shift + bits > 8 {
        word |= (code[byte + 1] as u16) << 8;
    }
    ((word >> shift) & ((1u16 << bits) - 1)) as usize
}

#[inline]
fn write_bits(code: &mut [u8], idx: usize, bits: usize, value: usize) {
    let bit = idx * bits;
    let byte = bit / 8;
    let shift = bit % 8;
    let word = (value as u16) << shift;
    code[byte] |= word as u8;
    if shift + bits > 8 {
        code[byte + 1] |= (word >> 8) as u8;
    }
}
