pub mod layout;
pub mod storage;

pub use layout::{
    vision_tensor_names, BlobTensor, CompressedMat, F32Vec, LayerWeights, ModelWeights,
    VitLayerWeights, VitWeights,
};
pub use storage::ByteStorage;

use crate::core::error::{EngineError, Result};
use half::bf16;
use std::fmt;
use std::str::FromStr;

/// Elements sharing one scale in the block-quantized representation.
pub const Q8_BLOCK: usize = 32;

/// Numeric encoding of the stored matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightRepr {
    F32,
    Bf16,
    /// 8-bit values with a single per-tensor scale.
    S8,
    /// 8-bit values with one scale per `Q8_BLOCK` elements.
    Q8,
}

impl WeightRepr {
    pub const ALL: [WeightRepr; 4] = [WeightRepr::F32, WeightRepr::Bf16, WeightRepr::S8, WeightRepr::Q8];

    pub fn name(&self) -> &'static str {
        match self {
            WeightRepr::F32 => "f32",
            WeightRepr::Bf16 => "bf16",
            WeightRepr::S8 => "s8",
            WeightRepr::Q8 => "q8",
        }
    }
}

impl fmt::Display for WeightRepr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WeightRepr {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        WeightRepr::ALL
            .into_iter()
            .find(|w| w.name() == s.to_ascii_lowercase())
            .ok_or_else(|| EngineError::UnknownWeightType(s.to_string()))
    }
}

/// Compile-time description of one weight representation.
///
/// `compress` always runs over a whole tensor; `dot` and `decompress` take the
/// element offset of the first value so that block scales can be located.
pub trait WeightType: Send + Sync + 'static {
    const REPR: WeightRepr;
    type Packed: bytemuck::Pod + Send + Sync;

    fn num_scales(_num_elements: usize) -> usize {
        0
    }

    fn compress(src: &[f32], packed: &mut [Self::Packed], scales: &mut [f32]);

    fn dot(packed: &[Self::Packed], scales: &[f32], offset: usize, x: &[f32]) -> f32;

    fn decompress(packed: &[Self::Packed], scales: &[f32], offset: usize, out: &mut [f32]);
}

pub struct Float32;
pub struct BFloat16;
pub struct Scaled8;
pub struct Block8;

impl WeightType for Float32 {
    const REPR: WeightRepr = WeightRepr::F32;
    type Packed = f32;

    fn compress(src: &[f32], packed: &mut [f32], _scales: &mut [f32]) {
        packed.copy_from_slice(src);
    }

    fn dot(packed: &[f32], _scales: &[f32], offset: usize, x: &[f32]) -> f32 {
        packed[offset..offset + x.len()]
            .iter()
            .zip(x)
            .map(|(w, v)| w * v)
            .sum()
    }

    fn decompress(packed: &[f32], _scales: &[f32], offset: usize, out: &mut [f32]) {
        out.copy_from_slice(&packed[offset..offset + out.len()]);
    }
}

impl WeightType for BFloat16 {
    const REPR: WeightRepr = WeightRepr::Bf16;
    type Packed = bf16;

    fn compress(src: &[f32], packed: &mut [bf16], _scales: &mut [f32]) {
        for (p, &v) in packed.iter_mut().zip(src) {
            *p = bf16::from_f32(v);
        }
    }

    fn dot(packed: &[bf16], _scales: &[f32], offset: usize, x: &[f32]) -> f32 {
        packed[offset..offset + x.len()]
            .iter()
            .zip(x)
            .map(|(w, v)| w.to_f32() * v)
            .sum()
    }

    fn decompress(packed: &[bf16], _scales: &[f32], offset: usize, out: &mut [f32]) {
        for (o, w) in out.iter_mut().zip(&packed[offset..]) {
            *o = w.to_f32();
        }
    }
}

fn quantize_i8(src: &[f32], dst: &mut [i8]) -> f32 {
    let max_abs = src.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let scale = max_abs / 127.0;
    let inv = if scale > 0.0 { 1.0 / scale } else { 0.0 };
    for (q, &v) in dst.iter_mut().zip(src) {
        *q = (v * inv).round().clamp(-127.0, 127.0) as i8;
    }
    scale
}

impl WeightType for Scaled8 {
    const REPR: WeightRepr = WeightRepr::S8;
    type Packed = i8;

    fn num_scales(_num_elements: usize) -> usize {
        1
    }

    fn compress(src: &[f32], packed: &mut [i8], scales: &mut [f32]) {
        scales[0] = quantize_i8(src, packed);
    }

    fn dot(packed: &[i8], scales: &[f32], offset: usize, x: &[f32]) -> f32 {
        let acc: f32 = packed[offset..offset + x.len()]
            .iter()
            .zip(x)
            .map(|(&q, v)| q as f32 * v)
            .sum();
        acc * scales[0]
    }

    fn decompress(packed: &[i8], scales: &[f32], offset: usize, out: &mut [f32]) {
        for (o, &q) in out.iter_mut().zip(&packed[offset..]) {
            *o = q as f32 * scales[0];
        }
    }
}

impl WeightType for Block8 {
    const REPR: WeightRepr = WeightRepr::Q8;
    type Packed = i8;

    fn num_scales(num_elements: usize) -> usize {
        num_elements.div_ceil(Q8_BLOCK)
    }

    fn compress(src: &[f32], packed: &mut [i8], scales: &mut [f32]) {
        for ((block, dst), scale) in src
            .chunks(Q8_BLOCK)
            .zip(packed.chunks_mut(Q8_BLOCK))
            .zip(scales.iter_mut())
        {
            *scale = quantize_i8(block, dst);
        }
    }

    fn dot(packed: &[i8], scales: &[f32], offset: usize, x: &[f32]) -> f32 {
        let mut acc = 0.0f32;
        let mut i = 0;
        while i < x.len() {
            let idx = offset + i;
            let block = idx / Q8_BLOCK;
            let end = ((block + 1) * Q8_BLOCK - offset).min(x.len());
            let partial: f32 = packed[idx..offset + end]
                .iter()
                .zip(&x[i..end])
                .map(|(&q, v)| q as f32 * v)
                .sum();
            acc += partial * scales[block];
            i = end;
        }
        acc
    }

    fn decompress(packed: &[i8], scales: &[f32], offset: usize, out: &mut [f32]) {
        for (i, o) in out.iter_mut().enumerate() {
            let idx = offset + i;
            *o = packed[idx] as f32 * scales[idx / Q8_BLOCK];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot_after_compress<W: WeightType>(src: &[f32], x: &[f32], offset: usize) -> f32 {
        let mut packed = vec![<W::Packed as bytemuck::Zeroable>::zeroed(); src.len()];
        let mut scales = vec![0.0; W::num_scales(src.len())];
        W::compress(src, &mut packed, &mut scales);
        W::dot(&packed, &scales, offset, x)
    }

    #[test]
    fn test_weight_repr_parse() {
        assert_eq!("bf16".parse::<WeightRepr>().unwrap(), WeightRepr::Bf16);
        assert_eq!("Q8".parse::<WeightRepr>().unwrap(), WeightRepr::Q8);
        assert!("q4".parse::<WeightRepr>().is_err());
    }

    #[test]
    fn test_compressed_dot_close_to_f32() {
        let src: Vec<f32> = (0..100).map(|i| ((i as f32) * 0.37).sin()).collect();
        let x: Vec<f32> = (0..40).map(|i| ((i as f32) * 0.11).cos()).collect();
        let exact = dot_after_compress::<Float32>(&src, &x, 45);
        let expected: f32 = src[45..85].iter().zip(&x).map(|(a, b)| a * b).sum();
        assert!((exact - expected).abs() < 1e-5);

        for approx in [
            dot_after_compress::<BFloat16>(&src, &x, 45),
            dot_after_compress::<Scaled8>(&src, &x, 45),
            dot_after_compress::<Block8>(&src, &x, 45),
        ] {
            assert!((approx - expected).abs() < 0.1, "{approx} vs {expected}");
        }
    }

    #[test]
    fn test_block8_scale_table_len() {
        assert_eq!(Block8::num_scales(64), 2);
        assert_eq!(Block8::num_scales(65), 3);
        assert_eq!(Scaled8::num_scales(1000), 1);
        assert_eq!(Float32::num_scales(1000), 0);
    }

    #[test]
    fn test_block8_decompress_matches_dot() {
        let src: Vec<f32> = (0..96).map(|i| i as f32 - 48.0).collect();
        let mut packed = vec![0i8; src.len()];
        let mut scales = vec![0.0; Block8::num_scales(src.len())];
        Block8::compress(&src, &mut packed, &mut scales);

        let mut row = vec![0.0; 50];
        Block8::decompress(&packed, &scales, 20, &mut row);
        let ones = vec![1.0; 50];
        let sum: f32 = row.iter().sum();
        assert!((Block8::dot(&packed, &scales, 20, &ones) - sum).abs() < 1e-3);
        assert!((row[0] - src[20]).abs() < 0.5);
    }
}
