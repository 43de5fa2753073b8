use super::{Float32, WeightType};
use crate::core::model::{ArchConfig, VitConfig};
use std::marker::PhantomData;

/// A named tensor as seen by the container: packed payload plus an optional
/// scale table, both viewed as raw bytes.
pub trait BlobTensor: Send + Sync {
    fn name(&self) -> &str;
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;
    fn packed_bytes(&self) -> &[u8];
    fn packed_bytes_mut(&mut self) -> &mut [u8];
    fn scale_bytes(&self) -> &[u8];
    fn scale_bytes_mut(&mut self) -> &mut [u8];
    fn set_from_f32(&mut self, src: &[f32]);
}

/// Row-major matrix stored in representation `W`.
pub struct CompressedMat<W: WeightType> {
    name: String,
    rows: usize,
    cols: usize,
    packed: Vec<W::Packed>,
    scales: Vec<f32>,
}

impl<W: WeightType> CompressedMat<W> {
    pub fn new(name: impl Into<String>, rows: usize, cols: usize) -> Self {
        let len = rows * cols;
        Self {
            name: name.into(),
            rows,
            cols,
            packed: vec![<W::Packed as bytemuck::Zeroable>::zeroed(); len],
            scales: vec![0.0; W::num_scales(len)],
        }
    }

    pub fn num_elements(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn row_dot(&self, row: usize, x: &[f32]) -> f32 {
        debug_assert_eq!(x.len(), self.cols);
        W::dot(&self.packed, &self.scales, row * self.cols, x)
    }

    pub fn decompress_row(&self, row: usize, out: &mut [f32]) {
        W::decompress(&self.packed, &self.scales, row * self.cols, out);
    }
}

impl CompressedMat<Float32> {
    pub fn values(&self) -> &[f32] {
        &self.packed
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.packed[row * self.cols..(row + 1) * self.cols]
    }
}

impl<W: WeightType> BlobTensor for CompressedMat<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn packed_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.packed)
    }

    fn packed_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.packed)
    }

    fn scale_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.scales)
    }

    fn scale_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.scales)
    }

    fn set_from_f32(&mut self, src: &[f32]) {
        W::compress(src, &mut self.packed, &mut self.scales);
    }
}

pub type F32Vec = CompressedMat<Float32>;

fn vector(name: String, len: usize) -> F32Vec {
    CompressedMat::new(name, 1, len)
}

pub struct LayerWeights<W: WeightType> {
    /// `(heads + 2 * kv_heads) * qkv_dim` rows: all query heads, then keys, then values.
    pub qkv_ein: CompressedMat<W>,
    pub att_ein: CompressedMat<W>,
    /// `2 * ff_hidden_dim` rows: gate, then up projection.
    pub gating_ein: CompressedMat<W>,
    pub linear_w: CompressedMat<W>,
    pub pre_att_ns: F32Vec,
    pub pre_ff_ns: F32Vec,
}

impl<W: WeightType> LayerWeights<W> {
    fn new<C: ArchConfig>(layer: usize) -> Self {
        let qkv_rows = (C::HEADS + 2 * C::KV_HEADS) * C::QKV_DIM;
        Self {
            qkv_ein: CompressedMat::new(format!("qkv_ein_{layer}"), qkv_rows, C::MODEL_DIM),
            att_ein: CompressedMat::new(
                format!("att_ein_{layer}"),
                C::MODEL_DIM,
                C::HEADS * C::QKV_DIM,
            ),
            gating_ein: CompressedMat::new(
                format!("gating_ein_{layer}"),
                2 * C::FF_HIDDEN_DIM,
                C::MODEL_DIM,
            ),
            linear_w: CompressedMat::new(format!("linear_w_{layer}"), C::MODEL_DIM, C::FF_HIDDEN_DIM),
            pre_att_ns: vector(format!("pre_att_ns_{layer}"), C::MODEL_DIM),
            pre_ff_ns: vector(format!("pre_ff_ns_{layer}"), C::MODEL_DIM),
        }
    }

    fn push<'a>(&'a self, out: &mut Vec<&'a dyn BlobTensor>) {
        out.extend([
            &self.qkv_ein as &dyn BlobTensor,
            &self.att_ein,
            &self.gating_ein,
            &self.linear_w,
            &self.pre_att_ns,
            &self.pre_ff_ns,
        ]);
    }

    fn push_mut<'a>(&'a mut self, out: &mut Vec<&'a mut dyn BlobTensor>) {
        out.push(&mut self.qkv_ein);
        out.push(&mut self.att_ein);
        out.push(&mut self.gating_ein);
        out.push(&mut self.linear_w);
        out.push(&mut self.pre_att_ns);
        out.push(&mut self.pre_ff_ns);
    }
}

pub struct VitLayerWeights<W: WeightType> {
    pub qkv: CompressedMat<W>,
    pub qkv_bias: F32Vec,
    pub att_out: CompressedMat<W>,
    pub att_out_bias: F32Vec,
    pub ln1_scale: F32Vec,
    pub ln1_bias: F32Vec,
    pub ln2_scale: F32Vec,
    pub ln2_bias: F32Vec,
    pub ff1: CompressedMat<W>,
    pub ff1_bias: F32Vec,
    pub ff2: CompressedMat<W>,
    pub ff2_bias: F32Vec,
}

const VIT_LAYER_TENSORS: [&str; 12] = [
    "v_qkv", "v_qkv_b", "v_att", "v_att_b", "v_ln1_s", "v_ln1_b", "v_ln2_s", "v_ln2_b", "v_ff1",
    "v_ff1_b", "v_ff2", "v_ff2_b",
];

const VIT_GLOBAL_TENSORS: [&str; 7] = [
    "enc_norm_scale",
    "enc_norm_bias",
    "img_emb_kernel",
    "img_emb_bias",
    "img_pos_emb",
    "img_head_kernel",
    "img_head_bias",
];

impl<W: WeightType> VitLayerWeights<W> {
    fn new(vit: &VitConfig, layer: usize) -> Self {
        let name = |i: usize| format!("{}_{layer}", VIT_LAYER_TENSORS[i]);
        let qkv_rows = 3 * vit.heads * vit.qkv_dim;
        Self {
            qkv: CompressedMat::new(name(0), qkv_rows, vit.model_dim),
            qkv_bias: vector(name(1), qkv_rows),
            att_out: CompressedMat::new(name(2), vit.model_dim, vit.heads * vit.qkv_dim),
            att_out_bias: vector(name(3), vit.model_dim),
            ln1_scale: vector(name(4), vit.model_dim),
            ln1_bias: vector(name(5), vit.model_dim),
            ln2_scale: vector(name(6), vit.model_dim),
            ln2_bias: vector(name(7), vit.model_dim),
            ff1: CompressedMat::new(name(8), vit.ff_hidden_dim, vit.model_dim),
            ff1_bias: vector(name(9), vit.ff_hidden_dim),
            ff2: CompressedMat::new(name(10), vit.model_dim, vit.ff_hidden_dim),
            ff2_bias: vector(name(11), vit.model_dim),
        }
    }

    fn push<'a>(&'a self, out: &mut Vec<&'a dyn BlobTensor>) {
        out.extend([
            &self.qkv as &dyn BlobTensor,
            &self.qkv_bias,
            &self.att_out,
            &self.att_out_bias,
            &self.ln1_scale,
            &self.ln1_bias,
            &self.ln2_scale,
            &self.ln2_bias,
            &self.ff1,
            &self.ff1_bias,
            &self.ff2,
            &self.ff2_bias,
        ]);
    }

    fn push_mut<'a>(&'a mut self, out: &mut Vec<&'a mut dyn BlobTensor>) {
        out.push(&mut self.qkv);
        out.push(&mut self.qkv_bias);
        out.push(&mut self.att_out);
        out.push(&mut self.att_out_bias);
        out.push(&mut self.ln1_scale);
        out.push(&mut self.ln1_bias);
        out.push(&mut self.ln2_scale);
        out.push(&mut self.ln2_bias);
        out.push(&mut self.ff1);
        out.push(&mut self.ff1_bias);
        out.push(&mut self.ff2);
        out.push(&mut self.ff2_bias);
    }
}

pub struct VitWeights<W: WeightType> {
    pub layers: Vec<VitLayerWeights<W>>,
    pub enc_norm_scale: F32Vec,
    pub enc_norm_bias: F32Vec,
    /// `vit.model_dim x patch_dim`; patch pixels are flattened row-major, RGB innermost.
    pub img_emb_kernel: CompressedMat<W>,
    pub img_emb_bias: F32Vec,
    pub img_pos_emb: F32Vec,
    /// Projects vision features into the language model's `model_dim`.
    pub img_head_kernel: CompressedMat<W>,
    pub img_head_bias: F32Vec,
}

impl<W: WeightType> VitWeights<W> {
    fn new(vit: &VitConfig, model_dim: usize) -> Self {
        Self {
            layers: (0..vit.layers).map(|l| VitLayerWeights::new(vit, l)).collect(),
            enc_norm_scale: vector(VIT_GLOBAL_TENSORS[0].to_string(), vit.model_dim),
            enc_norm_bias: vector(VIT_GLOBAL_TENSORS[1].to_string(), vit.model_dim),
            img_emb_kernel: CompressedMat::new(VIT_GLOBAL_TENSORS[2], vit.model_dim, vit.patch_dim()),
            img_emb_bias: vector(VIT_GLOBAL_TENSORS[3].to_string(), vit.model_dim),
            img_pos_emb: CompressedMat::new(VIT_GLOBAL_TENSORS[4], vit.seq_len(), vit.model_dim),
            img_head_kernel: CompressedMat::new(VIT_GLOBAL_TENSORS[5], model_dim, vit.model_dim),
            img_head_bias: vector(VIT_GLOBAL_TENSORS[6].to_string(), model_dim),
        }
    }

    fn push<'a>(&'a self, out: &mut Vec<&'a dyn BlobTensor>) {
        for layer in &self.layers {
            layer.push(out);
        }
        out.extend([
            &self.enc_norm_scale as &dyn BlobTensor,
            &self.enc_norm_bias,
            &self.img_emb_kernel,
            &self.img_emb_bias,
            &self.img_pos_emb,
            &self.img_head_kernel,
            &self.img_head_bias,
        ]);
    }

    fn push_mut<'a>(&'a mut self, out: &mut Vec<&'a mut dyn BlobTensor>) {
        for layer in &mut self.layers {
            layer.push_mut(out);
        }
        out.push(&mut self.enc_norm_scale);
        out.push(&mut self.enc_norm_bias);
        out.push(&mut self.img_emb_kernel);
        out.push(&mut self.img_emb_bias);
        out.push(&mut self.img_pos_emb);
        out.push(&mut self.img_head_kernel);
        out.push(&mut self.img_head_bias);
    }
}

/// Names of every vision-tower tensor, without scale-table entries.
pub fn vision_tensor_names(vit: &VitConfig) -> Vec<String> {
    let mut names: Vec<String> = (0..vit.layers)
        .flat_map(|layer| VIT_LAYER_TENSORS.iter().map(move |t| format!("{t}_{layer}")))
        .collect();
    names.extend(VIT_GLOBAL_TENSORS.iter().map(|t| t.to_string()));
    names
}

/// All tensors of one (architecture, representation) specialization.
pub struct ModelWeights<C: ArchConfig, W: WeightType> {
    /// `vocab_size x model_dim`, shared with the output projection.
    pub embedder: Option<CompressedMat<W>>,
    pub final_norm: Option<F32Vec>,
    pub layers: Vec<LayerWeights<W>>,
    pub vit: Option<VitWeights<W>>,
    _config: PhantomData<C>,
}

impl<C: ArchConfig, W: WeightType> ModelWeights<C, W> {
    /// Zero-filled layout for `C`.
    pub fn new() -> Self {
        let (embedder, final_norm) = if C::has_language_model() {
            (
                Some(CompressedMat::new("c_embedding", C::VOCAB_SIZE, C::MODEL_DIM)),
                Some(vector("c_final_norm".to_string(), C::MODEL_DIM)),
            )
        } else {
            (None, None)
        };
        Self {
            embedder,
            final_norm,
            layers: (0..C::LAYERS).map(LayerWeights::new::<C>).collect(),
            vit: C::VIT.map(|vit| VitWeights::new(&vit, C::MODEL_DIM)),
            _config: PhantomData,
        }
    }

    pub fn tensors(&self) -> Vec<&dyn BlobTensor> {
        let mut out: Vec<&dyn BlobTensor> = Vec::new();
        if let Some(embedder) = &self.embedder {
            out.push(embedder);
        }
        if let Some(norm) = &self.final_norm {
            out.push(norm);
        }
        for layer in &self.layers {
            layer.push(&mut out);
        }
        if let Some(vit) = &self.vit {
            vit.push(&mut out);
        }
        out
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut dyn BlobTensor> {
        let mut out: Vec<&mut dyn BlobTensor> = Vec::new();
        if let Some(embedder) = &mut self.embedder {
            out.push(embedder);
        }
        if let Some(norm) = &mut self.final_norm {
            out.push(norm);
        }
        for layer in &mut self.layers {
            layer.push_mut(&mut out);
        }
        if let Some(vit) = &mut self.vit {
            vit.push_mut(&mut out);
        }
        out
    }

    pub fn num_bytes(&self) -> usize {
        self.tensors()
            .iter()
            .map(|t| t.packed_bytes().len() + t.scale_bytes().len())
            .sum()
    }
}

impl<C: ArchConfig, W: WeightType> Default for ModelWeights<C, W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ConfigTiny, ConfigTinyVit, ConfigTinyVlm};
    use crate::core::weights::{Block8, Scaled8};
    use std::collections::HashSet;

    #[test]
    fn test_tensor_names_unique_and_short() {
        let weights = ModelWeights::<ConfigTinyVlm, Block8>::new();
        let names: Vec<&str> = weights.tensors().iter().map(|t| t.name()).collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
        assert!(names.iter().all(|n| n.len() < 16));
    }

    #[test]
    fn test_layout_sizes() {
        let weights = ModelWeights::<ConfigTiny, Scaled8>::new();
        let layer = &weights.layers[0];
        assert_eq!(layer.qkv_ein.rows(), (4 + 2 * 2) * 32);
        assert_eq!(layer.qkv_ein.packed_bytes().len(), (4 + 2 * 2) * 32 * 128);
        assert_eq!(layer.qkv_ein.scale_bytes().len(), 4);
        assert_eq!(layer.pre_att_ns.scale_bytes().len(), 0);
        assert!(weights.vit.is_none());
        assert_eq!(weights.tensors().len(), 2 + 3 * 6);
    }

    #[test]
    fn test_vision_only_layout_matches_vision_names() {
        let weights = ModelWeights::<ConfigTinyVit, Float32>::new();
        assert!(weights.embedder.is_none());
        let names: Vec<String> = weights.tensors().iter().map(|t| t.name().to_string()).collect();
        let vit = ConfigTinyVit::VIT.unwrap();
        assert_eq!(names, vision_tensor_names(&vit));
    }
}
