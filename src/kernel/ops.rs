use crate::core::weights::{BlobTensor, CompressedMat, F32Vec, WeightType};
use crate::infra::pools::NestedPools;

pub const RMS_EPS: f32 = 1e-6;
pub const LAYER_NORM_EPS: f32 = 1e-6;

/// Output elements handed to one pool task.
const MATMUL_CHUNK: usize = 64;

/// `out[t] = mat * input[t]` for every token row `t`.
pub fn matmul<W: WeightType>(
    pool: &NestedPools,
    mat: &CompressedMat<W>,
    input: &[f32],
    out: &mut [f32],
) {
    let (rows, cols) = (mat.rows(), mat.cols());
    debug_assert_eq!(input.len() / cols, out.len() / rows);
    pool.for_each_row_mut(out, MATMUL_CHUNK, |chunk, values| {
        for (j, o) in values.iter_mut().enumerate() {
            let idx = chunk * MATMUL_CHUNK + j;
            let (t, r) = (idx / rows, idx % rows);
            *o = mat.row_dot(r, &input[t * cols..(t + 1) * cols]);
        }
    });
}

/// Like `matmul`, then adds `bias` to every output row.
pub fn matmul_bias<W: WeightType>(
    pool: &NestedPools,
    mat: &CompressedMat<W>,
    bias: &F32Vec,
    input: &[f32],
    out: &mut [f32],
) {
    matmul(pool, mat, input, out);
    for row in out.chunks_mut(mat.rows()) {
        add_assign(row, bias.values());
    }
}

pub fn add_assign(x: &mut [f32], other: &[f32]) {
    for (a, b) in x.iter_mut().zip(other) {
        *a += b;
    }
}

/// Gemma-style RMS norm: the learned weight is an offset from one.
pub fn rms_norm(x: &[f32], weight: &[f32], out: &mut [f32]) {
    let ss: f32 = x.iter().map(|v| v * v).sum();
    let inv = 1.0 / (ss / x.len() as f32 + RMS_EPS).sqrt();
    for ((o, &v), &w) in out.iter_mut().zip(x).zip(weight) {
        *o = v * inv * (1.0 + w);
    }
}

pub fn layer_norm(x: &[f32], scale: &[f32], bias: &[f32], out: &mut [f32]) {
    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let inv = 1.0 / (var + LAYER_NORM_EPS).sqrt();
    for (((o, &v), &s), &b) in out.iter_mut().zip(x).zip(scale).zip(bias) {
        *o = (v - mean) * inv * s + b;
    }
}

/// Tanh approximation.
#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (0.797_884_6 * (x + 0.044_715 * x * x * x)).tanh())
}

pub fn softmax(x: &mut [f32]) {
    let max = x.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x.iter_mut() {
            *v /= sum;
        }
    }
}

/// Rotary position embedding over `x`, rotating element pairs `(i, i + half)`.
pub fn rope(x: &mut [f32], pos: usize) {
    let half = x.len() / 2;
    for i in 0..half {
        let inv_freq = 1.0 / 10000f32.powf(2.0 * i as f32 / x.len() as f32);
        let (sin, cos) = (pos as f32 * inv_freq).sin_cos();
        let (a, b) = (x[i], x[i + half]);
        x[i] = a * cos - b * sin;
        x[i + half] = a * sin + b * cos;
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
