use super::traits::{DecodeOptions, EncodeOptions, Tokenizer};
use crate::core::error::{EngineError, Result};
use crate::core::model::TokenId;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const SPACE: char = '▁';

/// On-disk vocabulary: one piece per id.
#[derive(Debug, Clone, Deserialize)]
pub struct Vocabulary {
    pub pieces: Vec<String>,
    #[serde(default = "default_bos")]
    pub bos_id: i32,
    #[serde(default = "default_eos")]
    pub eos_id: i32,
}

fn default_bos() -> i32 {
    TokenId::BOS.0
}

fn default_eos() -> i32 {
    TokenId::EOS.0
}

impl Vocabulary {
    pub fn new(pieces: Vec<String>) -> Self {
        Self {
            pieces,
            bos_id: default_bos(),
            eos_id: default_eos(),
        }
    }
}

/// Greedy longest-match tokenizer over a piece vocabulary, with
/// sentencepiece-style `▁` word boundaries.
pub struct VocabTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    max_piece_chars: usize,
}

impl VocabTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let encoder = vocab
            .pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| (piece.clone(), TokenId(i as i32)))
            .collect();
        let max_piece_chars = vocab.pieces.iter().map(|p| p.chars().count()).max().unwrap_or(1);
        Self {
            vocab,
            encoder,
            max_piece_chars,
        }
    }

    /// Loads a JSON vocabulary: `{"pieces": [...], "bos_id": 2, "eos_id": 1}`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, "read tokenizer", e))?;
        let vocab: Vocabulary = serde_json::from_str(&text)
            .map_err(|e| EngineError::Tokenizer(format!("{}: {e}", path.display())))?;
        if vocab.pieces.is_empty() {
            return Err(EngineError::Tokenizer(format!("{}: empty vocabulary", path.display())));
        }
        tracing::debug!(path = %path.display(), pieces = vocab.pieces.len(), "loaded vocabulary");
        Ok(Self::new(vocab))
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode_with_options(&self, text: &str, options: &EncodeOptions) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if options.add_bos {
            tokens.push(self.bos_token());
        }

        let normalized = text.replace(' ', &SPACE.to_string());
        let chars: Vec<char> = normalized.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let longest = (1..=self.max_piece_chars.min(chars.len() - i))
                .rev()
                .find_map(|len| {
                    let piece: String = chars[i..i + len].iter().collect();
                    self.encoder.get(&piece).map(|&id| (id, len))
                });
            match longest {
                Some((id, len)) => {
                    tokens.push(id);
                    i += len;
                }
                None => {
                    return Err(EngineError::Tokenizer(format!(
                        "no piece covers {:?} at offset {i}",
                        chars[i]
                    )))
                }
            }
        }

        Ok(tokens)
    }

    fn decode_with_options(&self, tokens: &[TokenId], options: &DecodeOptions) -> Result<String> {
        let mut text = String::new();
        for &id in tokens {
            if options.skip_special_tokens && (id == self.bos_token() || id == self.eos_token()) {
                continue;
            }
            let piece = self
                .id_to_token(id)
                .ok_or_else(|| EngineError::Tokenizer(format!("unknown token id {id}")))?;
            text.push_str(piece);
        }
        Ok(text.replace(SPACE, " "))
    }

    fn vocab_size(&self) -> usize {
        self.vocab.pieces.len()
    }

    fn bos_token(&self) -> TokenId {
        TokenId(self.vocab.bos_id)
    }

    fn eos_token(&self) -> TokenId {
        TokenId(self.vocab.eos_id)
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        self.encoder.get(token).copied()
    }

    fn id_to_token(&self, id: TokenId) -> Option<&str> {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.vocab.pieces.get(i))
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> VocabTokenizer {
        let pieces = ["<pad>", "</s>", "<s>", "▁Hello", "▁world", "▁", "H", "e", "l", "o", "!"];
        VocabTokenizer::new(Vocabulary::new(pieces.iter().map(|s| s.to_string()).collect()))
    }

    #[test]
    fn test_encode_prefers_longest_piece() {
        let tok = tokenizer();
        let ids = tok.encode_with_options(" Hello world!", &EncodeOptions::new().with_bos()).unwrap();
        assert_eq!(ids, vec![TokenId(2), TokenId(3), TokenId(4), TokenId(10)]);
    }

    #[test]
    fn test_decode_restores_spaces() {
        let tok = tokenizer();
        let text = tok
            .decode_with_options(&[TokenId(2), TokenId(3), TokenId(4)], &DecodeOptions::new().skip_special())
            .unwrap();
        assert_eq!(text, " Hello world");
    }

    #[test]
    fn test_unknown_character_is_an_error() {
        assert!(matches!(tokenizer().encode("z"), Err(EngineError::Tokenizer(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, r#"{"pieces": ["<pad>", "</s>", "<s>", "a"], "eos_id": 1}"#).unwrap();
        let tok = VocabTokenizer::from_file(&path).unwrap();
        assert_eq!(tok.vocab_size(), 4);
        assert_eq!(tok.bos_token(), TokenId::BOS);
        assert_eq!(tok.token_to_id("a"), Some(TokenId(3)));
    }
}
