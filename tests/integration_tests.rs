use localgen::core::tokenizer::Vocabulary;
use localgen::core::weights::WeightType;
use localgen::infra::extract_blobs;
use localgen::model::{call_for_model_and_weight, model_config, ArchConfig, ModelOp};
use localgen::{
    infra::extract_vision_tower, Architecture, BlobKey, BlobReader, BlobWriter, ByteStorage, Engine, EngineError,
    Image, ImageTokens, KVCache, ModelConfigInfo, ModelInfo, NestedPools, RuntimeConfig, TimingInfo, TokenId,
    Tristate, VocabTokenizer, WaitMode, WeightRepr,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

fn pools() -> Arc<NestedPools> {
    Arc::new(NestedPools::new(2, 2).unwrap())
}

fn random_engine(arch: Architecture, seed: u64) -> Engine {
    let pieces = (0..model_config(arch).vocab_size.max(3)).map(|i| format!("<{i}>")).collect();
    let tokenizer = Box::new(VocabTokenizer::new(Vocabulary::new(pieces)));
    let mut engine = Engine::with_tokenizer(tokenizer, ModelInfo::new(arch, WeightRepr::F32), pools()).unwrap();
    engine.weights_mut().randomize(seed).unwrap();
    engine
}

fn test_image(size: usize) -> Image {
    let data = (0..size * size * 3)
        .map(|i| ((i * 37 % 255) as f32 / 127.5) - 1.0)
        .collect();
    Image::new(size, size, data).unwrap()
}

/// Runs greedy generation and returns every streamed `(query, pos, token)`.
fn collect_stream(
    engine: &Engine,
    prompts: &[Vec<TokenId>],
    positions: &[usize],
    prefix_ends: &[usize],
    caches: &mut [KVCache],
    max_tokens: usize,
) -> Vec<(usize, usize, TokenId)> {
    let mut streamed = Vec::new();
    let mut runtime = RuntimeConfig::new(7)
        .max_generated_tokens(max_tokens)
        .eos_id(TokenId(-1))
        .stream(|query, pos, token, _| {
            streamed.push((query, pos, token));
            true
        });
    engine
        .generate_batch(&mut runtime, prompts, positions, prefix_ends, caches, &mut TimingInfo::default())
        .unwrap();
    drop(runtime);
    streamed
}

#[test]
fn test_extract_subset_of_container() {
    let pools = pools();
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("all.sbs");
    let dst = dir.path().join("subset.sbs");

    let (a, b, c) = (
        BlobKey::from_name("A").unwrap(),
        BlobKey::from_name("B").unwrap(),
        BlobKey::from_name("C").unwrap(),
    );
    let mut writer = BlobWriter::new();
    writer.add_owned(a, (0..10u8).collect()).unwrap();
    writer.add_owned(b, (0..20u8).map(|v| v + 100).collect()).unwrap();
    writer.add_owned(c, vec![7u8; 30]).unwrap();
    writer.write_all(&pools, &src).unwrap();

    let reader = BlobReader::open(&src).unwrap();
    extract_blobs(&reader, &[a, c], &pools, &dst).unwrap();

    let subset = BlobReader::open(&dst).unwrap();
    assert_eq!(subset.len(), 2);
    assert_eq!(subset.bytes(a).unwrap(), reader.bytes(a).unwrap());
    assert_eq!(subset.bytes(c).unwrap(), &[7u8; 30][..]);
    assert_eq!(subset.blob_size(c), Some(30));
    assert!(matches!(subset.bytes(b), Err(EngineError::KeyNotFound(_))));
}

#[test]
fn test_container_contents_independent_of_insertion_order() {
    let pools = pools();
    let dir = tempfile::tempdir().unwrap();
    let blobs: Vec<(BlobKey, Vec<u8>)> = ["qkv_ein_0", "att_ein_0", "$qkv_ein_0"]
        .iter()
        .enumerate()
        .map(|(i, name)| (BlobKey::from_name(name).unwrap(), vec![i as u8 + 1; 300 * (i + 1)]))
        .collect();

    let mut forward = BlobWriter::new();
    for (key, data) in &blobs {
        forward.add(*key, data).unwrap();
    }
    let mut reverse = BlobWriter::new();
    for (key, data) in blobs.iter().rev() {
        reverse.add(*key, data).unwrap();
    }
    forward.write_all(&pools, &dir.path().join("fwd.sbs")).unwrap();
    reverse.write_all(&pools, &dir.path().join("rev.sbs")).unwrap();

    let fwd = BlobReader::open(dir.path().join("fwd.sbs")).unwrap();
    let rev = BlobReader::open(dir.path().join("rev.sbs")).unwrap();
    for (key, data) in &blobs {
        assert_eq!(fwd.bytes(*key).unwrap(), data.as_slice());
        assert_eq!(rev.bytes(*key).unwrap(), data.as_slice());
    }
}

#[test]
fn test_batch_prefix_ends_default_to_zero() {
    let engine = random_engine(Architecture::Tiny, 3);
    let prompts = vec![vec![TokenId(3), TokenId(9), TokenId(12)], vec![TokenId(5)]];

    let mut caches = vec![engine.new_cache(), engine.new_cache()];
    let defaulted = collect_stream(&engine, &prompts, &[0, 0], &[], &mut caches, 4);
    let mut caches = vec![engine.new_cache(), engine.new_cache()];
    let explicit = collect_stream(&engine, &prompts, &[0, 0], &[0, 0], &mut caches, 4);

    assert_eq!(defaulted, explicit);
    assert_eq!(defaulted.len(), 8);
    // Decode steps alternate between queries.
    let queries: Vec<usize> = defaulted.iter().map(|s| s.0).collect();
    assert_eq!(queries, vec![0, 1, 0, 1, 0, 1, 0, 1]);
}

#[test]
fn test_split_prompt_matches_single_call() {
    let engine = random_engine(Architecture::Tiny, 5);
    let a = vec![TokenId(2), TokenId(17), TokenId(30)];
    let b = vec![TokenId(8), TokenId(41)];

    let mut split_cache = vec![engine.new_cache()];
    let first = collect_stream(&engine, &[a.clone()], &[0], &[], &mut split_cache, 0);
    assert!(first.is_empty());
    assert_eq!(split_cache[0].next_pos(), a.len());
    let split = collect_stream(&engine, &[b.clone()], &[a.len()], &[], &mut split_cache, 6);

    let joined: Vec<TokenId> = a.iter().chain(&b).copied().collect();
    let mut single_cache = vec![engine.new_cache()];
    let single = collect_stream(&engine, &[joined], &[0], &[], &mut single_cache, 6);

    assert_eq!(split, single);
    assert_eq!(split_cache[0].next_pos(), single_cache[0].next_pos());
    let last = split_cache[0].next_pos() - 1;
    let cfg = engine.model_config();
    for layer in 0..cfg.layers {
        for pos in 0..=last {
            assert_eq!(split_cache[0].key(layer, pos, 0), single_cache[0].key(layer, pos, 0));
            assert_eq!(split_cache[0].value(layer, pos, 0), single_cache[0].value(layer, pos, 0));
        }
    }
}

#[test]
fn test_spin_mode_restored_after_panic_in_stream() {
    let engine = random_engine(Architecture::Tiny, 9);
    let pools = Arc::clone(engine.pools());
    assert_eq!(pools.wait_mode(), WaitMode::Block);

    let observed = Arc::clone(&pools);
    let mut seen = None;
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut runtime = RuntimeConfig::new(1)
            .use_spinning(Tristate::True)
            .stream(|_, _, _, _| {
                seen = Some(observed.wait_mode());
                panic!("stream callback failed");
            });
        let mut cache = engine.new_cache();
        let _ = engine.generate(&mut runtime, &[TokenId(4)], 0, 0, &mut cache, &mut TimingInfo::default());
    }));

    assert!(result.is_err());
    assert_eq!(seen, Some(WaitMode::Spin));
    assert_eq!(pools.wait_mode(), WaitMode::Block);
}

#[test]
fn test_spin_mode_restored_after_error() {
    let engine = random_engine(Architecture::Tiny, 9);
    let mut runtime = RuntimeConfig::new(1).use_spinning(Tristate::True);
    let mut cache = engine.new_cache();
    let err = engine.generate(&mut runtime, &[TokenId(4)], 3, 0, &mut cache, &mut TimingInfo::default());
    assert!(matches!(err, Err(EngineError::InvalidPosition { .. })));
    assert_eq!(engine.pools().wait_mode(), WaitMode::Block);
}

#[test]
fn test_extracted_vision_tower_matches_full_model() {
    let dir = tempfile::tempdir().unwrap();
    let full_path = dir.path().join("tiny-vlm.sbs");
    let vit_path = dir.path().join("tiny-vit.sbs");

    let vlm = random_engine(Architecture::TinyVlm, 21);
    vlm.weights().save(vlm.pools(), &full_path).unwrap();
    let entries = extract_vision_tower(&full_path, Architecture::TinyVlm, vlm.pools(), &vit_path).unwrap();
    assert!(entries > 0);
    assert!(BlobReader::open(&vit_path).unwrap().len() < BlobReader::open(&full_path).unwrap().len());

    let mut vit = random_engine(Architecture::TinyVit, 99);
    *vit.weights_mut() =
        ByteStorage::load(&vit_path, ModelInfo::new(Architecture::TinyVit, WeightRepr::F32), vit.pools()).unwrap();

    let image = test_image(16);
    let runtime = RuntimeConfig::new(0);
    let mut from_vlm = ImageTokens::for_config(&vlm.model_config());
    let mut from_vit = ImageTokens::for_config(&vit.model_config());
    vlm.generate_image_tokens(&runtime, &image, &mut from_vlm, &mut TimingInfo::default())
        .unwrap();
    vit.generate_image_tokens(&runtime, &image, &mut from_vit, &mut TimingInfo::default())
        .unwrap();

    assert_eq!(from_vlm.rows(), from_vit.rows());
    assert_eq!(from_vlm.as_slice(), from_vit.as_slice());
    assert!(from_vit.as_slice().iter().all(|v| v.is_finite()));
}

#[test]
fn test_image_tokens_feed_generation() {
    let engine = random_engine(Architecture::TinyVlm, 4);
    let cfg = engine.model_config();
    let mut tokens = ImageTokens::for_config(&cfg);
    engine
        .generate_image_tokens(&RuntimeConfig::new(0), &test_image(16), &mut tokens, &mut TimingInfo::default())
        .unwrap();

    let prompt: Vec<TokenId> = (0..cfg.vit_seq_len + 2).map(|i| TokenId((i % 40) as i32 + 3)).collect();
    let mut count = 0;
    let mut runtime = RuntimeConfig::new(2)
        .max_generated_tokens(3)
        .eos_id(TokenId(-1))
        .image_tokens(&tokens)
        .stream(|_, _, _, _| {
            count += 1;
            true
        });
    let mut cache = engine.new_cache();
    engine
        .generate(&mut runtime, &prompt, 0, prompt.len(), &mut cache, &mut TimingInfo::default())
        .unwrap();
    drop(runtime);
    assert_eq!(count, 3);
    assert_eq!(cache.next_pos(), prompt.len() + 2);
}

struct ConfigOf;

impl ModelOp for ConfigOf {
    type Output = (ModelConfigInfo, WeightRepr);

    fn call<C: ArchConfig, W: WeightType>(self) -> Self::Output {
        (ModelConfigInfo::of::<C>(), W::REPR)
    }
}

#[test]
fn test_dispatch_reaches_every_pair() {
    for arch in Architecture::ALL {
        for weight in WeightRepr::ALL {
            match call_for_model_and_weight(arch, weight, ConfigOf) {
                Ok((config, repr)) => {
                    assert_eq!(config, model_config(arch), "{arch}/{weight}");
                    assert_eq!(repr, weight);
                }
                Err(EngineError::UnsupportedPair { arch: a, weight: w }) => {
                    assert_eq!((a, w), (arch, weight));
                }
                Err(e) => panic!("unexpected error for {arch}/{weight}: {e}"),
            }
        }
    }
}

#[test]
fn test_storage_rejects_foreign_representation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.sbs");
    let engine = random_engine(Architecture::Tiny, 1);
    engine.weights().save(engine.pools(), &path).unwrap();

    let loaded = ByteStorage::load(&path, ModelInfo::new(Architecture::Tiny, WeightRepr::F32), engine.pools());
    assert!(loaded.is_ok());
    let wrong = ByteStorage::load(&path, ModelInfo::new(Architecture::Tiny, WeightRepr::Bf16), engine.pools());
    assert!(matches!(wrong, Err(EngineError::SizeMismatch { .. })));
}
