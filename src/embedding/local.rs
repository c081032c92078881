//! Deterministic feature-hashing embedder.
//!
//! Lowercases the input, slides a character trigram window over it, hashes
//! each trigram with FNV-1a into one of [`EMBEDDING_DIM`](super::EMBEDDING_DIM)
//! buckets (with a sign bit from a second hash round), and L2-normalizes.
//! Similar strings share trigrams and therefore land near each other; an
//! identical string always maps to an identical vector.

use super::{EmbeddingProvider, EMBEDDING_DIM};
use anyhow::Result;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

#[derive(Default)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub fn new() -> Self {
        Self
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl EmbeddingProvider for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];

        let normalized: Vec<char> = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_whitespace() { ' ' } else { c })
            .collect();

        if normalized.len() < 3 {
            // Degenerate input: hash the whole string once.
            let h = fnv1a(text.as_bytes());
            v[(h % EMBEDDING_DIM as u64) as usize] = 1.0;
            return Ok(v);
        }

        for window in normalized.windows(3) {
            let gram: String = window.iter().collect();
            let h = fnv1a(gram.as_bytes());
            let bucket = (h % EMBEDDING_DIM as u64) as usize;
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }

        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic() {
        let embedder = HashingEmbedder::new();
        let a = embedder.embed("the deploy pipeline failed on friday").unwrap();
        let b = embedder.embed("the deploy pipeline failed on friday").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn embedding_is_normalized() {
        let embedder = HashingEmbedder::new();
        let v = embedder.embed("some reasonably long input text").unwrap();
        assert_eq!(v.len(), EMBEDDING_DIM);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_are_closer_than_dissimilar() {
        let embedder = HashingEmbedder::new();
        let base = embedder.embed("alice prefers rust for systems work").unwrap();
        let near = embedder.embed("alice prefers rust for system work").unwrap();
        let far = embedder.embed("quarterly revenue exceeded projections").unwrap();

        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&base, &near) > dot(&base, &far));
    }

    #[test]
    fn short_input_does_not_panic() {
        let embedder = HashingEmbedder::new();
        for s in ["", "a", "ab"] {
            let v = embedder.embed(s).unwrap();
            assert_eq!(v.len(), EMBEDDING_DIM);
        }
    }
}
