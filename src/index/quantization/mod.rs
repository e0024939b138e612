//! Vector quantization for inverted-list storage.
//!
//! Supported schemes:
//! - **Uniform SQ** (4, 6 or 8 bits per dimension): each component is mapped
//!   onto `2^bits` evenly spaced levels inside a trained per-dimension range
//!   and bit-packed into the code.
//! - **Float16**: each component is stored as an IEEE-754 half (2x
//!   compression). Narrower than f32 but far more precise than uniform SQ.

pub mod sq;

use serde::{Deserialize, Serialize};

pub use sq::{AsymmetricScorer, CodecParams, ScalarQuantizer};

/// How each component is held inside a list code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePrecision {
    /// Bit-packed uniform levels (`bits_per_dimension` bits each).
    #[default]
    Quantized,
    /// IEEE-754 half precision.
    Float16,
}

impl StoragePrecision {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            StoragePrecision::Quantized => 0,
            StoragePrecision::Float16 => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StoragePrecision::Quantized),
            1 => Some(StoragePrecision::Float16),
            _ => None,
        }
    }
}

/// Statistic used to derive the per-dimension quantization range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeStat {
    /// `[min, max]` of the sample, widened by `arg * (max - min)` on each side.
    #[default]
    MinMax,
    /// `mean ± arg * stddev`.
    MeanStd,
}

impl RangeStat {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            RangeStat::MinMax => 0,
            RangeStat::MeanStd => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RangeStat::MinMax),
            1 => Some(RangeStat::MeanStd),
            _ => None,
        }
    }
}
