use crate::core::image::ImageTokens;
use crate::core::model::TokenId;
use crate::infra::pools::Tristate;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;

/// Receives `(query, pos, token, probability)` for every sampled token.
/// Returning `false` stops that query.
pub type StreamFunc<'a> = Box<dyn FnMut(usize, usize, TokenId, f32) -> bool + 'a>;

/// Generation parameters for one call.
pub struct RuntimeConfig<'a> {
    pub max_generated_tokens: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub eos_id: TokenId,
    pub verbosity: u8,
    pub use_spinning: Tristate,
    pub rng: StdRng,
    pub stream_token: Option<StreamFunc<'a>>,
    /// Replaces the embeddings of the first `vit_seq_len` positions of every
    /// query that starts at pos 0; in a batch all such queries share the
    /// same image. Queries continuing a cache are unaffected.
    pub image_tokens: Option<&'a ImageTokens>,
}

impl<'a> RuntimeConfig<'a> {
    pub fn new(seed: u64) -> Self {
        Self {
            max_generated_tokens: 128,
            temperature: 1.0,
            top_k: 1,
            eos_id: TokenId::EOS,
            verbosity: 0,
            use_spinning: Tristate::Default,
            rng: StdRng::seed_from_u64(seed),
            stream_token: None,
            image_tokens: None,
        }
    }

    pub fn max_generated_tokens(mut self, max: usize) -> Self {
        self.max_generated_tokens = max;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn eos_id(mut self, eos: TokenId) -> Self {
        self.eos_id = eos;
        self
    }

    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn use_spinning(mut self, spin: Tristate) -> Self {
        self.use_spinning = spin;
        self
    }

    pub fn stream<F>(mut self, f: F) -> Self
    where
        F: FnMut(usize, usize, TokenId, f32) -> bool + 'a,
    {
        self.stream_token = Some(Box::new(f));
        self
    }

    /// See [`RuntimeConfig::image_tokens`](#structfield.image_tokens).
    pub fn image_tokens(mut self, tokens: &'a ImageTokens) -> Self {
        self.image_tokens = Some(tokens);
        self
    }

    /// Forwards a token to the stream callback; `true` means keep going.
    pub(crate) fn emit(&mut self, query: usize, pos: usize, token: TokenId, prob: f32) -> bool {
        match self.stream_token.as_mut() {
            Some(stream) => stream(query, pos, token, prob),
            None => true,
        }
    }
}

/// Phase timings, accumulated across calls that share it.
#[derive(Debug, Clone, Default)]
pub struct TimingInfo {
    pub prefill_duration: Duration,
    pub prefill_tokens: usize,
    pub generate_duration: Duration,
    pub generated_tokens: usize,
    pub time_to_first_token: Option<Duration>,
    pub image_duration: Duration,
}

impl TimingInfo {
    pub fn prefill_tokens_per_sec(&self) -> f64 {
        rate(self.prefill_tokens, self.prefill_duration)
    }

    pub fn generate_tokens_per_sec(&self) -> f64 {
        rate(self.generated_tokens, self.generate_duration)
    }
}

fn rate(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}
