pub mod cache;
pub mod error;
pub mod image;
pub mod model;
pub mod tokenizer;
pub mod weights;

pub use cache::{KVCache, KVCaches};
pub use error::{EngineError, Result};
pub use image::{Image, ImageTokens};
pub use model::{Architecture, ModelConfigInfo, ModelInfo, TokenId};
pub use tokenizer::{Tokenizer, VocabTokenizer};
pub use weights::{ByteStorage, WeightRepr};
