pub mod app;
pub mod core;
pub mod envconfig;
pub mod infra;
pub mod kernel;

pub mod model {
    pub use crate::core::model::*;
}

pub use crate::core::{
    Architecture, ByteStorage, EngineError, Image, ImageTokens, KVCache, KVCaches, ModelConfigInfo,
    ModelInfo, Result, TokenId, Tokenizer, VocabTokenizer, WeightRepr,
};

pub use crate::infra::{BlobKey, BlobReader, BlobWriter, NestedPools, Tristate, WaitMode};

pub use crate::app::{Engine, RuntimeConfig, TimingInfo};

pub use crate::envconfig::EngineEnv;
