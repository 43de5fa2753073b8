use super::configs::*;
use super::{Architecture, ModelConfigInfo, VitConfig};
use crate::core::error::{EngineError, Result};
use crate::core::weights::{BFloat16, Block8, Float32, Scaled8, WeightRepr, WeightType};

/// An operation that only depends on the architecture.
pub trait ArchOp {
    type Output;

    fn call<C: ArchConfig>(self) -> Self::Output;
}

/// An operation instantiated per (architecture, representation) pair.
///
/// Implementors close over the call's arguments; `call` is monomorphized for
/// the pair chosen at runtime, so dispatch costs two `match`es and nothing
/// else.
pub trait ModelOp {
    type Output;

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output;
}

pub fn call_for_model<Op: ArchOp>(arch: Architecture, op: Op) -> Op::Output {
    match arch {
        Architecture::Gemma2B => op.call::<ConfigGemma2B>(),
        Architecture::Gemma7B => op.call::<ConfigGemma7B>(),
        Architecture::Gemma2_2B => op.call::<ConfigGemma2_2B>(),
        Architecture::Gemma2_9B => op.call::<ConfigGemma2_9B>(),
        Architecture::PaliGemma224 => op.call::<ConfigPaliGemma224>(),
        Architecture::PaliGemmaVit224 => op.call::<ConfigPaliGemmaVit224>(),
        Architecture::Tiny => op.call::<ConfigTiny>(),
        Architecture::TinyVlm => op.call::<ConfigTinyVlm>(),
        Architecture::TinyVit => op.call::<ConfigTinyVit>(),
    }
}

pub fn call_for_model_and_weight<Op: ModelOp>(
    arch: Architecture,
    weight: WeightRepr,
    op: Op,
) -> Result<Op::Output> {
    call_for_model(arch, ForWeight { weight, op })
}

/// Second stage of the dispatch: instantiated once per architecture, it
/// resolves the representation.
struct ForWeight<Op> {
    weight: WeightRepr,
    op: Op,
}

impl<Op: ModelOp> ArchOp for ForWeight<Op> {
    type Output = Result<Op::Output>;

    fn call<C: ArchConfig>(self) -> Self::Output {
        if !C::supports(self.weight) {
            return Err(EngineError::UnsupportedPair {
                arch: C::ARCH,
                weight: self.weight,
            });
        }
        Ok(match self.weight {
            WeightRepr::F32 => self.op.call::<C, Float32>(),
            WeightRepr::Bf16 => self.op.call::<C, BFloat16>(),
            WeightRepr::S8 => self.op.call::<C, Scaled8>(),
            WeightRepr::Q8 => self.op.call::<C, Block8>(),
        })
    }
}

struct GetModelConfig;

impl ArchOp for GetModelConfig {
    type Output = ModelConfigInfo;

    fn call<C: ArchConfig>(self) -> ModelConfigInfo {
        ModelConfigInfo::of::<C>()
    }
}

pub fn model_config(arch: Architecture) -> ModelConfigInfo {
    call_for_model(arch, GetModelConfig)
}

struct GetVitConfig;

impl ArchOp for GetVitConfig {
    type Output = Option<VitConfig>;

    fn call<C: ArchConfig>(self) -> Option<VitConfig> {
        C::VIT
    }
}

pub fn vit_config(arch: Architecture) -> Option<VitConfig> {
    call_for_model(arch, GetVitConfig)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl ModelOp for Probe {
        type Output = (Architecture, WeightRepr, ModelConfigInfo);

        fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
            (C::ARCH, W::REPR, ModelConfigInfo::of::<C>())
        }
    }

    #[test]
    fn test_dispatch_reaches_matching_specialization() {
        for arch in Architecture::ALL {
            for weight in WeightRepr::ALL {
                match call_for_model_and_weight(arch, weight, Probe) {
                    Ok((got_arch, got_weight, config)) => {
                        assert_eq!(got_arch, arch);
                        assert_eq!(got_weight, weight);
                        assert_eq!(config, model_config(arch));
                    }
                    Err(EngineError::UnsupportedPair { arch: a, weight: w }) => {
                        assert_eq!((a, w), (arch, weight));
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }
    }

    #[test]
    fn test_model_config_constants() {
        let config = model_config(Architecture::Gemma2B);
        assert_eq!(config.layers, 18);
        assert_eq!(config.model_dim, 2048);
        assert_eq!(config.heads, 8);
        assert_eq!(config.kv_heads, 1);
        assert_eq!(config.qkv_dim, 256);
        assert_eq!(config.vit_seq_len, 0);

        let pali = model_config(Architecture::PaliGemma224);
        assert_eq!(pali.vit_seq_len, 256);
        assert!(pali.has_vision());
        assert_eq!(vit_config(Architecture::PaliGemma224), vit_config(Architecture::PaliGemmaVit224));
        assert_eq!(vit_config(Architecture::Gemma7B), None);
    }

    #[test]
    fn test_unsupported_pair_is_rejected() {
        let err = call_for_model_and_weight(Architecture::PaliGemma224, WeightRepr::Q8, Probe);
        assert!(matches!(err, Err(EngineError::UnsupportedPair { .. })));
        assert!(call_for_model_and_weight(Architecture::Tiny, WeightRepr::Q8, Probe).is_ok());
    }
}
