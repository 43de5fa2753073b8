use super::ops::{add_assign, dot, gelu, layer_norm, matmul_bias, softmax};
use crate::core::error::{EngineError, Result};
use crate::core::image::{Image, ImageTokens};
use crate::core::model::{ArchConfig, VitConfig};
use crate::core::weights::{ModelWeights, VitLayerWeights, WeightType};
use crate::infra::pools::NestedPools;

/// Encodes `image` into `out`, one row per patch in the language model's
/// embedding space.
pub fn image_tokens<C: ArchConfig, W: WeightType>(
    weights: &ModelWeights<C, W>,
    image: &Image,
    out: &mut ImageTokens,
    pool: &NestedPools,
) -> Result<()> {
    let (Some(vit), Some(tower)) = (C::VIT, weights.vit.as_ref()) else {
        return Err(EngineError::NoVisionTower(C::ARCH));
    };
    if image.width() != vit.image_size || image.height() != vit.image_size {
        return Err(EngineError::Image(format!(
            "{} expects a {size}x{size} image, got {}x{}",
            C::ARCH,
            image.width(),
            image.height(),
            size = vit.image_size,
        )));
    }
    let seq = vit.seq_len();
    if out.rows() != seq || out.cols() != C::MODEL_DIM {
        return Err(EngineError::LengthMismatch {
            what: "image token values",
            expected: seq * C::MODEL_DIM,
            actual: out.rows() * out.cols(),
        });
    }

    let patches = extract_patches(image, &vit);
    let mut x = vec![0.0; seq * vit.model_dim];
    matmul_bias(pool, &tower.img_emb_kernel, &tower.img_emb_bias, &patches, &mut x);
    add_assign(&mut x, tower.img_pos_emb.values());

    for layer in &tower.layers {
        encoder_layer(layer, &vit, &mut x, pool);
    }

    let mut normed = vec![0.0; x.len()];
    for (row, dst) in x.chunks(vit.model_dim).zip(normed.chunks_mut(vit.model_dim)) {
        layer_norm(row, tower.enc_norm_scale.values(), tower.enc_norm_bias.values(), dst);
    }
    matmul_bias(
        pool,
        &tower.img_head_kernel,
        &tower.img_head_bias,
        &normed,
        out.as_mut_slice(),
    );
    Ok(())
}

/// Flattens non-overlapping square patches in raster order; within a patch,
/// pixels are row-major with RGB innermost.
fn extract_patches(image: &Image, vit: &VitConfig) -> Vec<f32> {
    let pw = vit.patch_width;
    let per_side = vit.image_size / pw;
    let mut patches = Vec::with_capacity(vit.seq_len() * vit.patch_dim());
    for py in 0..per_side {
        for px in 0..per_side {
            for dy in 0..pw {
                for dx in 0..pw {
                    patches.extend_from_slice(&image.pixel(px * pw + dx, py * pw + dy));
                }
            }
        }
    }
    patches
}

fn encoder_layer<W: WeightType>(
    layer: &VitLayerWeights<W>,
    vit: &VitConfig,
    x: &mut [f32],
    pool: &NestedPools,
) {
    let d = vit.model_dim;
    let (heads, qkv_dim) = (vit.heads, vit.qkv_dim);
    let seq = x.len() / d;
    let width = heads * qkv_dim;

    let mut normed = vec![0.0; x.len()];
    for (row, dst) in x.chunks(d).zip(normed.chunks_mut(d)) {
        layer_norm(row, layer.ln1_scale.values(), layer.ln1_bias.values(), dst);
    }
    let mut qkv = vec![0.0; seq * 3 * width];
    matmul_bias(pool, &layer.qkv, &layer.qkv_bias, &normed, &mut qkv);

    let scale = 1.0 / (qkv_dim as f32).sqrt();
    let mut att = vec![0.0; seq * width];
    pool.for_each_row_mut(&mut att, qkv_dim, |idx, out| {
        let (t, head) = (idx / heads, idx % heads);
        let q = &qkv[t * 3 * width + head * qkv_dim..][..qkv_dim];
        let key = |j: usize| &qkv[j * 3 * width + width + head * qkv_dim..][..qkv_dim];
        let value = |j: usize| &qkv[j * 3 * width + 2 * width + head * qkv_dim..][..qkv_dim];

        let mut scores: Vec<f32> = (0..seq).map(|j| dot(q, key(j)) * scale).collect();
        softmax(&mut scores);
        out.fill(0.0);
        for (j, &s) in scores.iter().enumerate() {
            for (o, &v) in out.iter_mut().zip(value(j)) {
                *o += s * v;
            }
        }
    });

    let mut projected = vec![0.0; x.len()];
    matmul_bias(pool, &layer.att_out, &layer.att_out_bias, &att, &mut projected);
    add_assign(x, &projected);

    for (row, dst) in x.chunks(d).zip(normed.chunks_mut(d)) {
        layer_norm(row, layer.ln2_scale.values(), layer.ln2_bias.values(), dst);
    }
    let mut hidden = vec![0.0; seq * vit.ff_hidden_dim];
    matmul_bias(pool, &layer.ff1, &layer.ff1_bias, &normed, &mut hidden);
    hidden.iter_mut().for_each(|v| *v = gelu(*v));
    matmul_bias(pool, &layer.ff2, &layer.ff2_bias, &hidden, &mut projected);
    add_assign(x, &projected);
}
