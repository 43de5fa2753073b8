//! Reference CPU compute kernel.
//!
//! Every entry point is generic over an `ArchConfig` and a `WeightType` and
//! is reached through the dispatch layer, so each (architecture,
//! representation) pair is compiled separately.

pub mod generate;
pub mod ops;
pub mod sampling;
pub mod vit;

pub use generate::{generate, generate_batch};
pub use vit::image_tokens;
