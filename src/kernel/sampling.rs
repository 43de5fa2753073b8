use super::ops::softmax;
use crate::core::model::TokenId;
use rand::Rng;

/// Picks the next token from `logits`, returning it with its probability.
///
/// Greedy when `top_k <= 1` or `temperature <= 0`; otherwise samples from
/// the `top_k` most likely tokens after temperature scaling.
pub fn sample_token<R: Rng>(logits: &[f32], temperature: f32, top_k: usize, rng: &mut R) -> (TokenId, f32) {
    if top_k <= 1 || temperature <= 0.0 {
        let mut probs = logits.to_vec();
        softmax(&mut probs);
        let (best, prob) = probs
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc });
        return (TokenId(best as i32), prob);
    }

    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_unstable_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    order.truncate(top_k);

    let mut probs: Vec<f32> = order.iter().map(|&i| logits[i] / temperature).collect();
    softmax(&mut probs);

    let mut threshold: f32 = rng.gen();
    for (&i, &p) in order.iter().zip(&probs) {
        if threshold < p {
            return (TokenId(i as i32), p);
        }
        threshold -= p;
    }
    // Rounding left a sliver of mass unassigned.
    let last = order.len() - 1;
    (TokenId(order[last] as i32), probs[last])
}
