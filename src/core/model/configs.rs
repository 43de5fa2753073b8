use super::{Architecture, VitConfig};
use crate::core::weights::WeightRepr;

/// Compile-time descriptor of one architecture.
///
/// Every generation kernel is generic over an `ArchConfig` and a
/// `WeightType`, so each (architecture, representation) pair compiles into
/// its own specialization.
pub trait ArchConfig: Send + Sync + 'static {
    const ARCH: Architecture;
    const LAYERS: usize;
    const MODEL_DIM: usize;
    const HEADS: usize;
    const KV_HEADS: usize;
    const QKV_DIM: usize;
    const FF_HIDDEN_DIM: usize;
    const VOCAB_SIZE: usize;
    /// KV cache capacity in positions.
    const SEQ_LEN: usize;
    const VIT: Option<VitConfig>;
    const WEIGHTS: &'static [WeightRepr];

    fn supports(weight: WeightRepr) -> bool {
        Self::WEIGHTS.contains(&weight)
    }

    fn has_language_model() -> bool {
        Self::LAYERS > 0 && Self::VOCAB_SIZE > 0
    }
}

macro_rules! arch_config {
    ($name:ident => $arch:ident {
        layers: $layers:expr,
        model_dim: $model_dim:expr,
        heads: $heads:expr,
        kv_heads: $kv_heads:expr,
        qkv_dim: $qkv_dim:expr,
        ff_hidden_dim: $ff:expr,
        vocab_size: $vocab:expr,
        seq_len: $seq:expr,
        vit: $vit:expr,
        weights: $weights:expr $(,)?
    }) => {
        pub struct $name;

        impl ArchConfig for $name {
            const ARCH: Architecture = Architecture::$arch;
            const LAYERS: usize = $layers;
            const MODEL_DIM: usize = $model_dim;
            const HEADS: usize = $heads;
            const KV_HEADS: usize = $kv_heads;
            const QKV_DIM: usize = $qkv_dim;
            const FF_HIDDEN_DIM: usize = $ff;
            const VOCAB_SIZE: usize = $vocab;
            const SEQ_LEN: usize = $seq;
            const VIT: Option<VitConfig> = $vit;
            const WEIGHTS: &'static [WeightRepr] = $weights;
        }
    };
}

const ALL_WEIGHTS: &[WeightRepr] = &[WeightRepr::F32, WeightRepr::Bf16, WeightRepr::S8, WeightRepr::Q8];
const NO_BLOCK_QUANT: &[WeightRepr] = &[WeightRepr::F32, WeightRepr::Bf16, WeightRepr::S8];

const SIGLIP_224: VitConfig = VitConfig {
    layers: 27,
    model_dim: 1152,
    heads: 16,
    qkv_dim: 72,
    ff_hidden_dim: 4304,
    patch_width: 14,
    image_size: 224,
};

const TINY_VIT: VitConfig = VitConfig {
    layers: 2,
    model_dim: 32,
    heads: 2,
    qkv_dim: 16,
    ff_hidden_dim: 64,
    patch_width: 4,
    image_size: 16,
};

arch_config!(ConfigGemma2B => Gemma2B {
    layers: 18,
    model_dim: 2048,
    heads: 8,
    kv_heads: 1,
    qkv_dim: 256,
    ff_hidden_dim: 16384,
    vocab_size: 256000,
    seq_len: 4096,
    vit: None,
    weights: ALL_WEIGHTS,
});

arch_config!(ConfigGemma7B => Gemma7B {
    layers: 28,
    model_dim: 3072,
    heads: 16,
    kv_heads: 16,
    qkv_dim: 256,
    ff_hidden_dim: 24576,
    vocab_size: 256000,
    seq_len: 4096,
    vit: None,
    weights: ALL_WEIGHTS,
});

arch_config!(ConfigGemma2_2B => Gemma2_2B {
    layers: 26,
    model_dim: 2304,
    heads: 8,
    kv_heads: 4,
    qkv_dim: 256,
    ff_hidden_dim: 9216,
    vocab_size: 256000,
    seq_len: 8192,
    vit: None,
    weights: ALL_WEIGHTS,
});

arch_config!(ConfigGemma2_9B => Gemma2_9B {
    layers: 42,
    model_dim: 3584,
    heads: 16,
    kv_heads: 8,
    qkv_dim: 256,
    ff_hidden_dim: 14336,
    vocab_size: 256000,
    seq_len: 8192,
    vit: None,
    weights: ALL_WEIGHTS,
});

arch_config!(ConfigPaliGemma224 => PaliGemma224 {
    layers: 18,
    model_dim: 2048,
    heads: 8,
    kv_heads: 1,
    qkv_dim: 256,
    ff_hidden_dim: 16384,
    vocab_size: 257152,
    seq_len: 4096,
    vit: Some(SIGLIP_224),
    weights: NO_BLOCK_QUANT,
});

arch_config!(ConfigPaliGemmaVit224 => PaliGemmaVit224 {
    layers: 0,
    model_dim: 2048,
    heads: 8,
    kv_heads: 1,
    qkv_dim: 256,
    ff_hidden_dim: 0,
    vocab_size: 0,
    seq_len: 0,
    vit: Some(SIGLIP_224),
    weights: NO_BLOCK_QUANT,
});

arch_config!(ConfigTiny => Tiny {
    layers: 3,
    model_dim: 128,
    heads: 4,
    kv_heads: 2,
    qkv_dim: 32,
    ff_hidden_dim: 256,
    vocab_size: 64,
    seq_len: 64,
    vit: None,
    weights: ALL_WEIGHTS,
});

arch_config!(ConfigTinyVlm => TinyVlm {
    layers: 2,
    model_dim: 64,
    heads: 2,
    kv_heads: 1,
    qkv_dim: 32,
    ff_hidden_dim: 128,
    vocab_size: 48,
    seq_len: 96,
    vit: Some(TINY_VIT),
    weights: ALL_WEIGHTS,
});

arch_config!(ConfigTinyVit => TinyVit {
    layers: 0,
    model_dim: 64,
    heads: 2,
    kv_heads: 1,
    qkv_dim: 32,
    ff_hidden_dim: 0,
    vocab_size: 0,
    seq_len: 0,
    vit: Some(TINY_VIT),
    weights: ALL_WEIGHTS,
});
