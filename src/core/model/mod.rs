pub mod configs;
pub mod registry;

pub use configs::{
    ArchConfig, ConfigGemma2B, ConfigGemma2_2B, ConfigGemma2_9B, ConfigGemma7B,
    ConfigPaliGemma224, ConfigPaliGemmaVit224, ConfigTiny, ConfigTinyVit, ConfigTinyVlm,
};
pub use registry::{
    call_for_model, call_for_model_and_weight, model_config, vit_config, ArchOp, ModelOp,
};

use crate::core::error::{EngineError, Result};
use crate::core::weights::WeightRepr;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TokenId(pub i32);

impl TokenId {
    pub const PAD: Self = Self(0);
    pub const BOS: Self = Self(2);
    pub const EOS: Self = Self(1);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of compiled transformer variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Gemma2B,
    Gemma7B,
    Gemma2_2B,
    Gemma2_9B,
    PaliGemma224,
    PaliGemmaVit224,
    Tiny,
    TinyVlm,
    TinyVit,
}

impl Architecture {
    pub const ALL: [Architecture; 9] = [
        Architecture::Gemma2B,
        Architecture::Gemma7B,
        Architecture::Gemma2_2B,
        Architecture::Gemma2_9B,
        Architecture::PaliGemma224,
        Architecture::PaliGemmaVit224,
        Architecture::Tiny,
        Architecture::TinyVlm,
        Architecture::TinyVit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Gemma2B => "gemma-2b",
            Architecture::Gemma7B => "gemma-7b",
            Architecture::Gemma2_2B => "gemma2-2b",
            Architecture::Gemma2_9B => "gemma2-9b",
            Architecture::PaliGemma224 => "paligemma-224",
            Architecture::PaliGemmaVit224 => "paligemma-224-vit",
            Architecture::Tiny => "tiny",
            Architecture::TinyVlm => "tiny-vlm",
            Architecture::TinyVit => "tiny-vit",
        }
    }

    /// The vision-only architecture whose container `extract-vit` produces.
    pub fn vision_only(&self) -> Option<Architecture> {
        match self {
            Architecture::PaliGemma224 | Architecture::PaliGemmaVit224 => {
                Some(Architecture::PaliGemmaVit224)
            }
            Architecture::TinyVlm | Architecture::TinyVit => Some(Architecture::TinyVit),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Architecture::ALL
            .into_iter()
            .find(|a| a.name() == lower)
            .ok_or_else(|| EngineError::UnknownArchitecture(s.to_string()))
    }
}

/// Identity of a loaded model; fixes the layout of its `ByteStorage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelInfo {
    pub model: Architecture,
    pub weight: WeightRepr,
}

impl ModelInfo {
    pub fn new(model: Architecture, weight: WeightRepr) -> Self {
        Self { model, weight }
    }
}

impl fmt::Display for ModelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.weight)
    }
}

/// Shape of an architecture's vision tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VitConfig {
    pub layers: usize,
    pub model_dim: usize,
    pub heads: usize,
    pub qkv_dim: usize,
    pub ff_hidden_dim: usize,
    pub patch_width: usize,
    pub image_size: usize,
}

impl VitConfig {
    pub const fn seq_len(&self) -> usize {
        let per_side = self.image_size / self.patch_width;
        per_side * per_side
    }

    pub const fn patch_dim(&self) -> usize {
        self.patch_width * self.patch_width * 3
    }
}

/// Read-only summary of a compiled architecture, for sizing caller buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfigInfo {
    pub layers: usize,
    pub model_dim: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub qkv_dim: usize,
    pub ff_hidden_dim: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    /// Zero when the architecture has no vision tower.
    pub vit_seq_len: usize,
}

impl ModelConfigInfo {
    pub fn of<C: ArchConfig>() -> Self {
        Self {
            layers: C::LAYERS,
            model_dim: C::MODEL_DIM,
            heads: C::HEADS,
            kv_heads: C::KV_HEADS,
            qkv_dim: C::QKV_DIM,
            ff_hidden_dim: C::FF_HIDDEN_DIM,
            vocab_size: C::VOCAB_SIZE,
            seq_len: C::SEQ_LEN,
            vit_seq_len: C::VIT.map(|v| v.seq_len()).unwrap_or(0),
        }
    }

    pub fn has_vision(&self) -> bool {
        self.vit_seq_len > 0
    }
}
