use crate::error::{IvfSqError, Result};
use crate::index::ivf_sq::invlists::GrowthPolicy;
use crate::index::quantization::{RangeStat, StoragePrecision};
use crate::types::DistanceMetric;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_nlist")]
    pub nlist: usize,
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    #[serde(default = "default_metric")]
    pub metric: DistanceMetric,
}

/// Scalar quantizer settings for list codes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_bits_per_dimension")]
    pub bits_per_dimension: u8,
    #[serde(default)]
    pub storage_precision: StoragePrecision,
    #[serde(default)]
    pub range_stat: RangeStat,
    #[serde(default)]
    pub range_stat_arg: f32,
    #[serde(default)]
    pub by_residual: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_kmeans_max_iterations")]
    pub kmeans_max_iterations: usize,
    #[serde(default = "default_kmeans_convergence_epsilon")]
    pub kmeans_convergence_epsilon: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Cap on the number of sample vectors used to fit codec parameters.
    #[serde(default)]
    pub max_codec_samples: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Upper bound on inverted-list storage. `None` means unlimited.
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: Option<usize>,
    /// Worker threads for batch work; 0 lets rayon pick.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    #[serde(default)]
    pub growth_policy: GrowthPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_dims() -> usize {
    std::env::var("IVFSQ_DIMS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(128)
}
fn default_nlist() -> usize {
    std::env::var("IVFSQ_NLIST")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(256)
}
fn default_nprobe() -> usize {
    std::env::var("IVFSQ_NPROBE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(16)
}
fn default_metric() -> DistanceMetric {
    std::env::var("IVFSQ_METRIC")
        .ok()
        .and_then(|v| parse_metric(&v))
        .unwrap_or_default()
}
fn default_bits_per_dimension() -> u8 {
    8
}
fn default_kmeans_max_iterations() -> usize {
    25
}
fn default_kmeans_convergence_epsilon() -> f64 {
    1e-4
}
fn default_seed() -> u64 {
    std::env::var("IVFSQ_SEED")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1234)
}
fn default_memory_limit_bytes() -> Option<usize> {
    std::env::var("IVFSQ_MEMORY_LIMIT_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
}
fn default_num_threads() -> usize {
    std::env::var("IVFSQ_NUM_THREADS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    std::env::var("IVFSQ_LOG_FORMAT").unwrap_or_else(|_| "text".to_string())
}

fn parse_metric(s: &str) -> Option<DistanceMetric> {
    match s.to_ascii_lowercase().as_str() {
        "l2" | "euclidean" => Some(DistanceMetric::L2),
        "ip" | "inner_product" => Some(DistanceMetric::InnerProduct),
        _ => None,
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dims: default_dims(),
            nlist: default_nlist(),
            nprobe: default_nprobe(),
            metric: default_metric(),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            bits_per_dimension: default_bits_per_dimension(),
            storage_precision: StoragePrecision::default(),
            range_stat: RangeStat::default(),
            range_stat_arg: 0.0,
            by_residual: false,
        }
    }
}

impl CodecConfig {
    /// Uniform codes with `bits` bits per dimension.
    pub fn quantized(bits: u8) -> Self {
        Self {
            bits_per_dimension: bits,
            ..Self::default()
        }
    }

    /// Half-precision storage of the raw components.
    pub fn float16() -> Self {
        Self {
            storage_precision: StoragePrecision::Float16,
            ..Self::default()
        }
    }

    pub fn with_residual(mut self, by_residual: bool) -> Self {
        self.by_residual = by_residual;
        self
    }

    pub fn with_range_stat(mut self, stat: RangeStat, arg: f32) -> Self {
        self.range_stat = stat;
        self.range_stat_arg = arg;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_precision == StoragePrecision::Quantized
            && !matches!(self.bits_per_dimension, 4 | 6 | 8)
        {
            return Err(IvfSqError::InvalidArgument(format!(
                "bits_per_dimension must be 4, 6 or 8, got {}",
                self.bits_per_dimension
            )));
        }
        if !self.range_stat_arg.is_finite() || self.range_stat_arg < 0.0 {
            return Err(IvfSqError::InvalidArgument(format!(
                "range_stat_arg must be a non-negative finite number, got {}",
                self.range_stat_arg
            )));
        }
        if self.range_stat == RangeStat::MeanStd && self.range_stat_arg <= 0.0 {
            return Err(IvfSqError::InvalidArgument(
                "mean_std range needs a positive range_stat_arg".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            kmeans_max_iterations: default_kmeans_max_iterations(),
            kmeans_convergence_epsilon: default_kmeans_convergence_epsilon(),
            seed: default_seed(),
            max_codec_samples: None,
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: default_memory_limit_bytes(),
            num_threads: default_num_threads(),
            growth_policy: GrowthPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults.
    /// After loading, env var overrides are applied so that:
    /// env var > TOML file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    IvfSqError::Config(format!("failed to read config file {p}: {e}"))
                })?;
                Self::from_toml_str(&content)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| IvfSqError::Config(format!("failed to parse config: {e}")))
    }

    /// Cross-field checks that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.index.dims == 0 {
            return Err(IvfSqError::Config("index.dims must be > 0".into()));
        }
        if self.index.nlist == 0 {
            return Err(IvfSqError::Config("index.nlist must be > 0".into()));
        }
        if self.index.nprobe == 0 || self.index.nprobe > self.index.nlist {
            return Err(IvfSqError::Config(format!(
                "index.nprobe must be in 1..={}, got {}",
                self.index.nlist, self.index.nprobe
            )));
        }
        self.codec
            .validate()
            .map_err(|e| IvfSqError::Config(e.to_string()))
    }

    /// Apply environment variable overrides on top of file/default values.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = std::env::var("IVFSQ_DIMS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.index.dims = v;
        }
        if let Some(v) = std::env::var("IVFSQ_NLIST")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.index.nlist = v;
        }
        if let Some(v) = std::env::var("IVFSQ_NPROBE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.index.nprobe = v;
        }
        if let Some(v) = std::env::var("IVFSQ_METRIC")
            .ok()
            .and_then(|v| parse_metric(&v))
        {
            self.index.metric = v;
        }
        if let Some(v) = std::env::var("IVFSQ_SEED")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.training.seed = v;
        }
        if let Some(v) = std::env::var("IVFSQ_MEMORY_LIMIT_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.resources.memory_limit_bytes = Some(v);
        }
        if let Some(v) = std::env::var("IVFSQ_NUM_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.resources.num_threads = v;
        }
        if let Ok(v) = std::env::var("IVFSQ_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("IVFSQ_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}
