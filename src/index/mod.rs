//! Index module for IVF-SQ vector search.
//!
//! Provides the `VectorIndex` trait, distance kernels, scalar quantization
//! and the IVF-SQ index implementation.

pub mod distance;
pub mod ivf_sq;
pub mod quantization;
pub mod traits;

// Re-export the core trait and the IVF-SQ implementation at the module level
// so callers can write `use ivfsq::index::{VectorIndex, IvfSqIndex}`.
pub use ivf_sq::{IvfSqIndex, PortableIndex};
pub use traits::VectorIndex;
