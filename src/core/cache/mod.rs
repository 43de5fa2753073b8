use crate::core::model::{model_config, Architecture, ModelConfigInfo};

/// Per-query attention key/value cache.
///
/// Layout is `[layer][pos][kv_head][k|v][qkv_dim]`. `next_pos` is the first
/// position not yet written; generation must resume exactly there.
#[derive(Clone)]
pub struct KVCache {
    config: ModelConfigInfo,
    data: Vec<f32>,
    next_pos: usize,
}

/// One cache per query, index-aligned with the batch.
pub type KVCaches = Vec<KVCache>;

impl KVCache {
    pub fn new(config: ModelConfigInfo) -> Self {
        let len = config.layers * config.seq_len * config.kv_heads * 2 * config.qkv_dim;
        Self {
            config,
            data: vec![0.0; len],
            next_pos: 0,
        }
    }

    pub fn for_arch(arch: Architecture) -> Self {
        Self::new(model_config(arch))
    }

    pub fn config(&self) -> &ModelConfigInfo {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.seq_len
    }

    pub fn next_pos(&self) -> usize {
        self.next_pos
    }

    pub fn is_empty(&self) -> bool {
        self.next_pos == 0
    }

    /// Forgets all cached positions so the cache can start a new sequence.
    pub fn reset(&mut self) {
        self.next_pos = 0;
    }

    pub(crate) fn set_next_pos(&mut self, pos: usize) {
        debug_assert!(pos <= self.capacity());
        self.next_pos = pos;
    }

    #[inline]
    fn offset(&self, layer: usize, pos: usize, kv_head: usize) -> usize {
        let c = &self.config;
        (((layer * c.seq_len + pos) * c.kv_heads + kv_head) * 2) * c.qkv_dim
    }

    pub fn key(&self, layer: usize, pos: usize, kv_head: usize) -> &[f32] {
        let begin = self.offset(layer, pos, kv_head);
        &self.data[begin..begin + self.config.qkv_dim]
    }

    pub fn value(&self, layer: usize, pos: usize, kv_head: usize) -> &[f32] {
        let begin = self.offset(layer, pos, kv_head) + self.config.qkv_dim;
        &self.data[begin..begin + self.config.qkv_dim]
    }

    /// Key and value slots for one head at one position.
    pub fn entry_mut(&mut self, layer: usize, pos: usize, kv_head: usize) -> (&mut [f32], &mut [f32]) {
        let begin = self.offset(layer, pos, kv_head);
        let dim = self.config.qkv_dim;
        self.data[begin..begin + 2 * dim].split_at_mut(dim)
    }
}

impl std::fmt::Debug for KVCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KVCache")
            .field("layers", &self.config.layers)
            .field("capacity", &self.config.seq_len)
            .field("next_pos", &self.next_pos)
            .finish()
    }
}
