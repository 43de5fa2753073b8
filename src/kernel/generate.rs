use super::ops::{add_assign, dot, gelu, matmul, rms_norm, rope, softmax};
use super::sampling::sample_token;
use crate::app::runtime::{RuntimeConfig, TimingInfo};
use crate::core::cache::KVCache;
use crate::core::error::{EngineError, Result};
use crate::core::image::ImageTokens;
use crate::core::model::{ArchConfig, ModelConfigInfo, TokenId};
use crate::core::weights::{CompressedMat, LayerWeights, ModelWeights, WeightType};
use crate::infra::pools::NestedPools;
use std::time::Instant;

/// Per-query decode state.
struct QueryState {
    next_pos: usize,
    pending: Option<TokenId>,
    generated: usize,
    done: bool,
}

/// Checks every per-query precondition before any cache is touched.
fn validate<C: ArchConfig>(
    prompts: &[&[TokenId]],
    positions: &[usize],
    prefix_ends: &[usize],
    caches: &[KVCache],
    image: Option<&ImageTokens>,
) -> Result<()> {
    for (what, len) in [
        ("positions", positions.len()),
        ("prefix ends", prefix_ends.len()),
        ("KV caches", caches.len()),
    ] {
        if len != prompts.len() {
            return Err(EngineError::LengthMismatch {
                what,
                expected: prompts.len(),
                actual: len,
            });
        }
    }

    if let Some(image) = image {
        let vit = C::VIT.ok_or(EngineError::NoVisionTower(C::ARCH))?;
        for (what, expected, actual) in [
            ("image token rows", vit.seq_len(), image.rows()),
            ("image token width", C::MODEL_DIM, image.cols()),
        ] {
            if expected != actual {
                return Err(EngineError::LengthMismatch { what, expected, actual });
            }
        }
    }

    let config = ModelConfigInfo::of::<C>();
    for (query, prompt) in prompts.iter().enumerate() {
        let (pos, prefix_end, cache) = (positions[query], prefix_ends[query], &caches[query]);
        if *cache.config() != config {
            return Err(EngineError::CacheMismatch { query });
        }
        if prompt.is_empty() {
            return Err(EngineError::EmptyPrompt { query });
        }
        if pos != cache.next_pos() {
            return Err(EngineError::InvalidPosition {
                query,
                expected: cache.next_pos(),
                actual: pos,
            });
        }
        let prompt_end = pos + prompt.len();
        if prefix_end > prompt_end {
            return Err(EngineError::PrefixEnd {
                query,
                prefix_end,
                prompt_end,
            });
        }
        if prompt_end > C::SEQ_LEN {
            return Err(EngineError::CacheFull {
                query,
                needed: prompt_end,
                capacity: C::SEQ_LEN,
            });
        }
        if let Some(bad) = prompt.iter().find(|t| t.0 < 0 || t.index() >= C::VOCAB_SIZE) {
            return Err(EngineError::TokenOutOfRange {
                query,
                token: bad.0,
                vocab_size: C::VOCAB_SIZE,
            });
        }
        if let (0, Some(image)) = (pos, image) {
            if prompt.len() < image.rows() {
                return Err(EngineError::ImagePromptTooShort {
                    query,
                    prompt_len: prompt.len(),
                    image_rows: image.rows(),
                });
            }
        }
    }
    Ok(())
}

/// Prefills each query's prompt, then decodes all queries step by step
/// until each one stops.
#[allow(clippy::too_many_arguments)]
pub fn generate_batch<C: ArchConfig, W: WeightType>(
    weights: &ModelWeights<C, W>,
    runtime: &mut RuntimeConfig,
    prompts: &[&[TokenId]],
    positions: &[usize],
    prefix_ends: &[usize],
    caches: &mut [KVCache],
    pool: &NestedPools,
    timing: &mut TimingInfo,
) -> Result<()> {
    let embedder = weights
        .embedder
        .as_ref()
        .ok_or(EngineError::NoLanguageModel(C::ARCH))?;
    validate::<C>(prompts, positions, prefix_ends, caches, runtime.image_tokens)?;

    let start = Instant::now();
    let mut states = Vec::with_capacity(prompts.len());
    for (query, prompt) in prompts.iter().enumerate() {
        let pos = positions[query];
        let cache = &mut caches[query];

        let mut x = vec![0.0; prompt.len() * C::MODEL_DIM];
        embed(weights, prompt, &mut x);
        if let (0, Some(image)) = (pos, runtime.image_tokens) {
            x[..image.as_slice().len()].copy_from_slice(image.as_slice());
        }
        forward(weights, &mut x, pos, prefix_ends[query], cache, pool);
        cache.set_next_pos(pos + prompt.len());

        let mut state = QueryState {
            next_pos: pos + prompt.len(),
            pending: None,
            generated: 0,
            done: runtime.max_generated_tokens == 0,
        };
        if !state.done {
            let logits = logits(weights, embedder, &x, pool);
            sample_and_emit::<C>(runtime, query, &mut state, &logits, start, timing);
        }
        states.push(state);
    }
    let prefill = start.elapsed();
    timing.prefill_duration += prefill;
    timing.prefill_tokens += prompts.iter().map(|p| p.len()).sum::<usize>();

    let decode_start = Instant::now();
    loop {
        let mut active = false;
        for (query, state) in states.iter_mut().enumerate() {
            if state.done {
                continue;
            }
            let Some(token) = state.pending else {
                continue;
            };
            active = true;

            let cache = &mut caches[query];
            let mut x = vec![0.0; C::MODEL_DIM];
            embed(weights, &[token], &mut x);
            forward(weights, &mut x, state.next_pos, 0, cache, pool);
            state.next_pos += 1;
            cache.set_next_pos(state.next_pos);

            let logits = logits(weights, embedder, &x, pool);
            sample_and_emit::<C>(runtime, query, state, &logits, start, timing);
        }
        if !active {
            break;
        }
    }
    timing.generate_duration += decode_start.elapsed();

    if runtime.verbosity >= 1 {
        tracing::info!(
            queries = prompts.len(),
            prefill_ms = prefill.as_millis() as u64,
            prefill_tok_s = format!("{:.1}", timing.prefill_tokens_per_sec()),
            decode_tok_s = format!("{:.1}", timing.generate_tokens_per_sec()),
            "generation finished"
        );
    }
    Ok(())
}

/// Single-query form of `generate_batch`; the query index is always 0.
#[allow(clippy::too_many_arguments)]
pub fn generate<C: ArchConfig, W: WeightType>(
    weights: &ModelWeights<C, W>,
    runtime: &mut RuntimeConfig,
    prompt: &[TokenId],
    pos: usize,
    prefix_end: usize,
    cache: &mut KVCache,
    pool: &NestedPools,
    timing: &mut TimingInfo,
) -> Result<()> {
    generate_batch(
        weights,
        runtime,
        &[prompt],
        &[pos],
        &[prefix_end],
        std::slice::from_mut(cache),
        pool,
        timing,
    )
}

fn sample_and_emit<C: ArchConfig>(
    runtime: &mut RuntimeConfig,
    query: usize,
    state: &mut QueryState,
    logits: &[f32],
    start: Instant,
    timing: &mut TimingInfo,
) {
    let (token, prob) = sample_token(logits, runtime.temperature, runtime.top_k, &mut runtime.rng);
    state.generated += 1;
    timing.generated_tokens += 1;
    timing.time_to_first_token.get_or_insert_with(|| start.elapsed());
    if runtime.verbosity >= 2 {
        tracing::debug!(query, pos = state.next_pos, token = token.0, prob, "sampled");
    }

    let keep_going = runtime.emit(query, state.next_pos, token, prob);
    // A token sampled at the last cache position can be streamed but never fed back.
    state.done = !keep_going
        || token == runtime.eos_id
        || state.generated >= runtime.max_generated_tokens
        || state.next_pos >= C::SEQ_LEN;
    state.pending = Some(token);
}

fn embed<C: ArchConfig, W: WeightType>(weights: &ModelWeights<C, W>, tokens: &[TokenId], x: &mut [f32]) {
    let Some(embedder) = weights.embedder.as_ref() else {
        return;
    };
    let scale = (C::MODEL_DIM as f32).sqrt();
    for (token, row) in tokens.iter().zip(x.chunks_mut(C::MODEL_DIM)) {
        embedder.decompress_row(token.index(), row);
        for v in row.iter_mut() {
            *v *= scale;
        }
    }
}

/// Runs all transformer layers over `x` (one row per token starting at
/// `start_pos`), writing keys and values into `cache`.
fn forward<C: ArchConfig, W: WeightType>(
    weights: &ModelWeights<C, W>,
    x: &mut [f32],
    start_pos: usize,
    prefix_end: usize,
    cache: &mut KVCache,
    pool: &NestedPools,
) {
    for (l, layer) in weights.layers.iter().enumerate() {
        transformer_layer::<C, W>(layer, l, x, start_pos, prefix_end, cache, pool);
    }
}

fn transformer_layer<C: ArchConfig, W: WeightType>(
    layer: &LayerWeights<W>,
    l: usize,
    x: &mut [f32],
    start_pos: usize,
    prefix_end: usize,
    cache: &mut KVCache,
    pool: &NestedPools,
) {
    let d = C::MODEL_DIM;
    let (heads, kv_heads, qkv_dim) = (C::HEADS, C::KV_HEADS, C::QKV_DIM);
    let tokens = x.len() / d;
    let qkv_rows = (heads + 2 * kv_heads) * qkv_dim;

    let mut normed = vec![0.0; x.len()];
    for (row, out) in x.chunks(d).zip(normed.chunks_mut(d)) {
        rms_norm(row, layer.pre_att_ns.values(), out);
    }
    let mut qkv = vec![0.0; tokens * qkv_rows];
    matmul(pool, &layer.qkv_ein, &normed, &mut qkv);

    let query_scale = 1.0 / (qkv_dim as f32).sqrt();
    for (t, row) in qkv.chunks_mut(qkv_rows).enumerate() {
        let pos = start_pos + t;
        for head in row[..heads * qkv_dim].chunks_mut(qkv_dim) {
            rope(head, pos);
            head.iter_mut().for_each(|v| *v *= query_scale);
        }
        for kv in 0..kv_heads {
            let k_off = (heads + kv) * qkv_dim;
            let v_off = (heads + kv_heads + kv) * qkv_dim;
            rope(&mut row[k_off..k_off + qkv_dim], pos);
            let (k, v) = cache.entry_mut(l, pos, kv);
            k.copy_from_slice(&row[k_off..k_off + qkv_dim]);
            v.copy_from_slice(&row[v_off..v_off + qkv_dim]);
        }
    }

    let mut att = vec![0.0; tokens * heads * qkv_dim];
    let group = heads / kv_heads;
    let cache: &KVCache = cache;
    pool.for_each_row_mut(&mut att, qkv_dim, |idx, out| {
        let (t, head) = (idx / heads, idx % heads);
        let pos = start_pos + t;
        // Prefix positions see the whole prefix; everything else is causal.
        let last = if pos < prefix_end { prefix_end - 1 } else { pos };
        let q = &qkv[t * qkv_rows + head * qkv_dim..][..qkv_dim];
        let kv = head / group;

        let mut scores: Vec<f32> = (0..=last).map(|j| dot(q, cache.key(l, j, kv))).collect();
        softmax(&mut scores);
        out.fill(0.0);
        for (j, &s) in scores.iter().enumerate() {
            for (o, &v) in out.iter_mut().zip(cache.value(l, j, kv)) {
                *o += s * v;
            }
        }
    });

    let mut projected = vec![0.0; x.len()];
    matmul(pool, &layer.att_ein, &att, &mut projected);
    add_assign(x, &projected);

    for (row, out) in x.chunks(d).zip(normed.chunks_mut(d)) {
        rms_norm(row, layer.pre_ff_ns.values(), out);
    }
    let ff = C::FF_HIDDEN_DIM;
    let mut gate_up = vec![0.0; tokens * 2 * ff];
    matmul(pool, &layer.gating_ein, &normed, &mut gate_up);
    let mut hidden = vec![0.0; tokens * ff];
    for (h, gu) in hidden.chunks_mut(ff).zip(gate_up.chunks(2 * ff)) {
        let (gate, up) = gu.split_at(ff);
        for ((o, &g), &u) in h.iter_mut().zip(gate).zip(up) {
            *o = gelu(g) * u;
        }
    }
    matmul(pool, &layer.linear_w, &hidden, &mut projected);
    add_assign(x, &projected);
}

/// Final norm of the last row, then the tied output projection.
fn logits<C: ArchConfig, W: WeightType>(
    weights: &ModelWeights<C, W>,
    embedder: &CompressedMat<W>,
    x: &[f32],
    pool: &NestedPools,
) -> Vec<f32> {
    let last = &x[x.len() - C::MODEL_DIM..];
    let mut normed = vec![0.0; C::MODEL_DIM];
    match weights.final_norm.as_ref() {
        Some(norm) => rms_norm(last, norm.values(), &mut normed),
        None => normed.copy_from_slice(last),
    }
    let mut logits = vec![0.0; C::VOCAB_SIZE];
    matmul(pool, embedder, &normed, &mut logits);
    logits
}
