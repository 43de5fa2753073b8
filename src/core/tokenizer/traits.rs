use crate::core::error::Result;
use crate::core::model::TokenId;

/// Text to token-id conversion. The engine only ever sees token ids; the
/// tokenizer is held for callers that need to encode prompts or decode the
/// stream.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        self.encode_with_options(text, &EncodeOptions::default())
    }

    fn encode_with_options(&self, text: &str, options: &EncodeOptions) -> Result<Vec<TokenId>>;

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        self.decode_with_options(tokens, &DecodeOptions::default())
    }

    fn decode_with_options(&self, tokens: &[TokenId], options: &DecodeOptions) -> Result<String>;

    fn vocab_size(&self) -> usize;
    fn bos_token(&self) -> TokenId;
    fn eos_token(&self) -> TokenId;

    fn token_to_id(&self, token: &str) -> Option<TokenId>;
    fn id_to_token(&self, id: TokenId) -> Option<&str>;
}

#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    pub add_bos: bool,
}

impl EncodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bos(mut self) -> Self {
        self.add_bos = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    pub skip_special_tokens: bool,
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_special(mut self) -> Self {
        self.skip_special_tokens = true;
        self
    }
}
