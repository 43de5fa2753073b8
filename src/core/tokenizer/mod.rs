pub mod traits;
pub mod vocab;

pub use traits::{DecodeOptions, EncodeOptions, Tokenizer};
pub use vocab::{VocabTokenizer, Vocabulary};
