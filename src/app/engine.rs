use super::runtime::{RuntimeConfig, TimingInfo};
use crate::core::cache::KVCache;
use crate::core::error::{EngineError, Result};
use crate::core::image::{Image, ImageTokens};
use crate::core::model::{
    call_for_model_and_weight, model_config, ArchConfig, ModelConfigInfo, ModelInfo, ModelOp, TokenId,
};
use crate::core::tokenizer::{Tokenizer, VocabTokenizer};
use crate::core::weights::{ByteStorage, WeightRepr, WeightType};
use crate::infra::pools::NestedPools;
use crate::kernel;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Generation front end: owns the weights of one model and runs every
/// request on the shared pools.
pub struct Engine {
    pools: Arc<NestedPools>,
    tokenizer: Box<dyn Tokenizer>,
    info: ModelInfo,
    weights: ByteStorage,
}

impl Engine {
    pub fn new(
        tokenizer_path: &Path,
        weights_path: &Path,
        info: ModelInfo,
        pools: Arc<NestedPools>,
    ) -> Result<Self> {
        let tokenizer = VocabTokenizer::from_file(tokenizer_path)?;
        let weights = ByteStorage::load(weights_path, info, &pools)?;
        tracing::info!(model = %info, pools = ?pools, "engine ready");
        Ok(Self {
            pools,
            tokenizer: Box::new(tokenizer),
            info,
            weights,
        })
    }

    /// Engine over zero-filled `f32` weights, to be populated through
    /// [`Engine::weights_mut`].
    pub fn with_tokenizer(tokenizer: Box<dyn Tokenizer>, info: ModelInfo, pools: Arc<NestedPools>) -> Result<Self> {
        if info.weight != WeightRepr::F32 {
            return Err(EngineError::Config(format!(
                "in-memory weights must be f32, got {}",
                info.weight
            )));
        }
        let weights = ByteStorage::allocate(info)?;
        Ok(Self {
            pools,
            tokenizer,
            info,
            weights,
        })
    }

    pub fn info(&self) -> ModelInfo {
        self.info
    }

    pub fn model_config(&self) -> ModelConfigInfo {
        model_config(self.info.model)
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn pools(&self) -> &Arc<NestedPools> {
        &self.pools
    }

    pub fn weights(&self) -> &ByteStorage {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut ByteStorage {
        &mut self.weights
    }

    /// A KV cache sized for this engine's model.
    pub fn new_cache(&self) -> KVCache {
        KVCache::new(self.model_config())
    }

    pub fn generate(
        &self,
        runtime: &mut RuntimeConfig,
        prompt: &[TokenId],
        pos: usize,
        prefix_end: usize,
        cache: &mut KVCache,
        timing: &mut TimingInfo,
    ) -> Result<()> {
        let _spin = self.pools.spin_guard(runtime.use_spinning);
        let op = GenerateSingle {
            storage: &self.weights,
            pools: &self.pools,
            runtime,
            prompt,
            pos,
            prefix_end,
            cache,
            timing,
        };
        call_for_model_and_weight(self.info.model, self.info.weight, op)?
    }

    /// Runs every query to completion. An empty `prefix_ends` means zero for
    /// every query.
    pub fn generate_batch(
        &self,
        runtime: &mut RuntimeConfig,
        prompts: &[Vec<TokenId>],
        positions: &[usize],
        prefix_ends: &[usize],
        caches: &mut [KVCache],
        timing: &mut TimingInfo,
    ) -> Result<()> {
        let _spin = self.pools.spin_guard(runtime.use_spinning);
        let zeros;
        let prefix_ends = if prefix_ends.is_empty() {
            zeros = vec![0; prompts.len()];
            &zeros[..]
        } else {
            prefix_ends
        };
        let prompts: Vec<&[TokenId]> = prompts.iter().map(Vec::as_slice).collect();
        let op = GenerateBatch {
            storage: &self.weights,
            pools: &self.pools,
            runtime,
            prompts: &prompts,
            positions,
            prefix_ends,
            caches,
            timing,
        };
        call_for_model_and_weight(self.info.model, self.info.weight, op)?
    }

    /// Encodes `image` with the vision tower. `out` must be sized
    /// `vit_seq_len x model_dim`, see [`ImageTokens::for_config`].
    pub fn generate_image_tokens(
        &self,
        runtime: &RuntimeConfig,
        image: &Image,
        out: &mut ImageTokens,
        timing: &mut TimingInfo,
    ) -> Result<()> {
        let _spin = self.pools.spin_guard(runtime.use_spinning);
        let start = Instant::now();
        let op = GenerateImageTokens {
            storage: &self.weights,
            pools: &self.pools,
            image,
            out,
        };
        call_for_model_and_weight(self.info.model, self.info.weight, op)??;
        timing.image_duration += start.elapsed();
        if runtime.verbosity >= 1 {
            tracing::info!(model = %self.info, elapsed_ms = start.elapsed().as_millis() as u64, "image tokens ready");
        }
        Ok(())
    }
}

struct GenerateSingle<'a, 'r> {
    storage: &'a ByteStorage,
    pools: &'a NestedPools,
    runtime: &'a mut RuntimeConfig<'r>,
    prompt: &'a [TokenId],
    pos: usize,
    prefix_end: usize,
    cache: &'a mut KVCache,
    timing: &'a mut TimingInfo,
}

impl ModelOp for GenerateSingle<'_, '_> {
    type Output = Result<()>;

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
        kernel::generate(
            self.storage.get::<C, W>()?,
            self.runtime,
            self.prompt,
            self.pos,
            self.prefix_end,
            self.cache,
            self.pools,
            self.timing,
        )
    }
}

struct GenerateBatch<'a, 'r> {
    storage: &'a ByteStorage,
    pools: &'a NestedPools,
    runtime: &'a mut RuntimeConfig<'r>,
    prompts: &'a [&'a [TokenId]],
    positions: &'a [usize],
    prefix_ends: &'a [usize],
    caches: &'a mut [KVCache],
    timing: &'a mut TimingInfo,
}

impl ModelOp for GenerateBatch<'_, '_> {
    type Output = Result<()>;

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
        kernel::generate_batch(
            self.storage.get::<C, W>()?,
            self.runtime,
            self.prompts,
            self.positions,
            self.prefix_ends,
            self.caches,
            self.pools,
            self.timing,
        )
    }
}

struct GenerateImageTokens<'a> {
    storage: &'a ByteStorage,
    pools: &'a NestedPools,
    image: &'a Image,
    out: &'a mut ImageTokens,
}

impl ModelOp for GenerateImageTokens<'_> {
    type Output = Result<()>;

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
        kernel::image_tokens(self.storage.get::<C, W>()?, self.image, self.out, self.pools)
    }
}
