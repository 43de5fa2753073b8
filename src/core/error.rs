use std::path::PathBuf;
use thiserror::Error;

use crate::core::model::Architecture;
use crate::core::weights::WeightRepr;

/// Errors raised by the engine core.
///
/// Configuration, I/O and usage errors are all reported here; the binary
/// turns any of them into process termination.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid weight container {}: {reason}", path.display())]
    BadContainer { path: PathBuf, reason: String },

    #[error("key {0:?} is longer than 16 bytes")]
    KeyTooLong(String),

    #[error("key {0} not found in container")]
    KeyNotFound(String),

    #[error("tensor {tensor}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },

    #[error("key {0} was already added to the writer")]
    DuplicateKey(String),

    #[error("weight type {weight} is not compiled for architecture {arch}")]
    UnsupportedPair {
        arch: Architecture,
        weight: WeightRepr,
    },

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("unknown weight type: {0}")]
    UnknownWeightType(String),

    #[error("weights were created for {stored_arch}/{stored_weight} but accessed as {arch}/{weight}")]
    StorageMismatch {
        stored_arch: Architecture,
        stored_weight: WeightRepr,
        arch: Architecture,
        weight: WeightRepr,
    },

    #[error("{what}: expected {expected} entries, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("query {query}: generation must start at pos {expected}, got {actual}")]
    InvalidPosition {
        query: usize,
        expected: usize,
        actual: usize,
    },

    #[error("query {query}: prefix end {prefix_end} exceeds prompt end {prompt_end}")]
    PrefixEnd {
        query: usize,
        prefix_end: usize,
        prompt_end: usize,
    },

    #[error("query {query}: KV cache was sized for a different model configuration")]
    CacheMismatch { query: usize },

    #[error("query {query}: prompt is empty")]
    EmptyPrompt { query: usize },

    #[error("query {query}: {needed} positions do not fit in a KV cache of {capacity}")]
    CacheFull {
        query: usize,
        needed: usize,
        capacity: usize,
    },

    #[error("query {query}: token {token} is outside the vocabulary of {vocab_size}")]
    TokenOutOfRange {
        query: usize,
        token: i32,
        vocab_size: usize,
    },

    #[error("query {query}: prompt of {prompt_len} tokens cannot hold {image_rows} image tokens")]
    ImagePromptTooShort {
        query: usize,
        prompt_len: usize,
        image_rows: usize,
    },

    #[error("architecture {0} has no language model")]
    NoLanguageModel(Architecture),

    #[error("architecture {0} has no vision tower")]
    NoVisionTower(Architecture),

    #[error("image error: {0}")]
    Image(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("thread pool error: {0}")]
    Pool(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, op: &'static str, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            op,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
