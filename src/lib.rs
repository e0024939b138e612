//! ivfsq: inverted-file vector search over scalar-quantized codes.

pub mod config;
pub mod error;
pub mod index;
pub mod logging;
pub mod metrics;
pub mod resources;
pub mod types;

pub use config::{CodecConfig, Config};
pub use error::{ErrorKind, IvfSqError, Result};
pub use index::{IvfSqIndex, PortableIndex, VectorIndex};
pub use resources::Resources;
pub use types::{DistanceMetric, SearchResult, SearchResults, VectorId, SENTINEL_ID};
