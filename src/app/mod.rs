pub mod engine;
pub mod runtime;

pub use engine::Engine;
pub use runtime::{RuntimeConfig, StreamFunc, TimingInfo};
